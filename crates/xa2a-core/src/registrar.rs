//! Capture-time buffer registration
//!
//! A captured kernel launch bakes in peer addresses. After capture every
//! rank must learn every other rank's captured (handle, offset) pairs and
//! hand the full table to its kernel context so replays resolve them.

use crate::group::{broadcast_object, ProcessGroup};
use crate::kernel::{CaptureMetadata, ContextHandle, KernelBackend};
use crate::Result;

/// Exchange this rank's capture metadata with the group and register the
/// consolidated table with `ctx`.
///
/// One broadcast per rank, in ascending rank order, so every rank builds an
/// identical table. Collective and not reentrant: callers serialise it.
pub fn register_graph_buffers<G>(
    group: &G,
    kernel: &dyn KernelBackend,
    ctx: ContextHandle,
) -> Result<()>
where
    G: ProcessGroup + ?Sized,
{
    let local = kernel.capture_buffer_metadata(ctx)?;
    tracing::info!(
        rank = group.rank(),
        addresses = local.offsets.len(),
        "registering captured buffer addresses"
    );

    let table = exchange_capture_metadata(group, local)?;
    let (handles, offsets): (Vec<Vec<u8>>, Vec<Vec<i64>>) = table
        .into_iter()
        .map(|meta| (meta.handles, meta.offsets))
        .unzip();
    kernel.register_capture_buffers(ctx, &handles, &offsets)
}

/// Every rank's metadata, indexed by rank. Collective.
pub fn exchange_capture_metadata<G>(
    group: &G,
    local: CaptureMetadata,
) -> Result<Vec<CaptureMetadata>>
where
    G: ProcessGroup + ?Sized,
{
    let rank = group.rank();
    let mut slots = vec![CaptureMetadata::default(); group.world_size()];
    slots[rank] = local;
    for src in 0..slots.len() {
        slots[src] = broadcast_object(group, &slots[src], src)?;
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_group::LocalGroup;
    use std::thread;

    fn meta_for(rank: usize) -> CaptureMetadata {
        CaptureMetadata {
            handles: vec![rank as u8; 64 * (rank + 1)],
            offsets: (0..=rank as i64).map(|i| i * 256).collect(),
        }
    }

    #[test]
    fn test_exchange_is_rank_ordered_and_identical() {
        let handles: Vec<_> = LocalGroup::new(4)
            .into_iter()
            .map(|g| {
                thread::spawn(move || exchange_capture_metadata(&g, meta_for(g.rank())).unwrap())
            })
            .collect();
        let tables: Vec<Vec<CaptureMetadata>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let expected: Vec<CaptureMetadata> = (0..4).map(meta_for).collect();
        for table in &tables {
            assert_eq!(table, &expected);
        }
    }
}
