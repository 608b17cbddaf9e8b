//! Cross-process shared buffers
//!
//! A [`SharedBuffer`] is one buffer family: `world_size` addresses of the
//! same byte size, one per rank. This rank's slot is the region it
//! allocated; every other slot is a mapping of a peer's region.

use crate::group::{all_gather_object, ProcessGroup};
use crate::runtime::{DevicePtr, DeviceRuntime, IpcHandle};
use crate::Result;

/// One slot of a buffer family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Allocated by this process; freed by it.
    Owned(DevicePtr),
    /// A peer's region mapped here. Never freed by this process.
    Peer(DevicePtr),
}

impl Mapping {
    pub fn ptr(&self) -> DevicePtr {
        match self {
            Mapping::Owned(ptr) | Mapping::Peer(ptr) => *ptr,
        }
    }
}

/// A buffer family with every rank's mapping established.
#[derive(Debug, PartialEq, Eq)]
pub struct SharedBuffer {
    size: usize,
    mappings: Vec<Mapping>,
}

impl SharedBuffer {
    /// Allocate `size` bytes locally and exchange handles with every rank.
    ///
    /// Collective: all ranks must create their families in the same order,
    /// or slot `i` will not hold rank `i`'s region.
    pub fn create<G, R>(runtime: &R, group: &G, size: usize) -> Result<Self>
    where
        G: ProcessGroup + ?Sized,
        R: DeviceRuntime + ?Sized,
    {
        let rank = group.rank();
        let local = runtime.allocate(size)?;
        let handle = match runtime.export_handle(local) {
            Ok(handle) => handle,
            Err(e) => {
                release_after_failure(runtime, local);
                return Err(e);
            }
        };

        let handles: Vec<IpcHandle> = match all_gather_object(group, &handle) {
            Ok(handles) => handles,
            Err(e) => {
                release_after_failure(runtime, local);
                return Err(e);
            }
        };

        let mut mappings = Vec::with_capacity(handles.len());
        for (peer, handle) in handles.iter().enumerate() {
            if peer == rank {
                mappings.push(Mapping::Owned(local));
                continue;
            }
            match runtime.import_handle(handle) {
                Ok(ptr) => mappings.push(Mapping::Peer(ptr)),
                Err(e) => {
                    tracing::error!(rank, peer, error = %e, "failed to import peer buffer");
                    let held = mappings.iter().filter(|m| matches!(m, Mapping::Peer(_))).count();
                    if held > 0 {
                        tracing::warn!(rank, held, "peer mappings stay held by the runtime");
                    }
                    release_after_failure(runtime, local);
                    return Err(e);
                }
            }
        }

        tracing::debug!(rank, size, "shared buffer established");
        Ok(Self { size, mappings })
    }

    /// Byte size of every region in the family
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Addresses ordered by rank
    pub fn ptrs(&self) -> Vec<DevicePtr> {
        self.mappings.iter().map(Mapping::ptr).collect()
    }

    /// This rank's own region
    pub fn local(&self) -> Option<DevicePtr> {
        self.mappings.iter().find_map(|m| match m {
            Mapping::Owned(ptr) => Some(*ptr),
            Mapping::Peer(_) => None,
        })
    }

    /// Release the locally owned region. Peer mappings are left alone.
    pub fn free<R: DeviceRuntime + ?Sized>(self, runtime: &R) -> Result<()> {
        match self.local() {
            Some(ptr) => runtime.free(ptr),
            None => Ok(()),
        }
    }
}

fn release_after_failure<R: DeviceRuntime + ?Sized>(runtime: &R, ptr: DevicePtr) {
    if let Err(e) = runtime.free(ptr) {
        tracing::warn!(?ptr, error = %e, "failed to release buffer after setup failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_group::LocalGroup;
    use crate::shm::HostShmRuntime;
    use crate::Error;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Host runtime whose n-th import (0-based) fails. Frees are recorded
    /// and applied later, so peers can still map a region its owner gave up.
    struct FailingImport {
        inner: HostShmRuntime,
        imports: AtomicUsize,
        fail_at: usize,
        freed: Mutex<Vec<DevicePtr>>,
    }

    impl DeviceRuntime for FailingImport {
        fn is_available(&self) -> bool {
            true
        }

        fn device_count(&self) -> Result<usize> {
            self.inner.device_count()
        }

        fn allocate(&self, bytes: usize) -> Result<DevicePtr> {
            self.inner.allocate(bytes)
        }

        fn export_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
            self.inner.export_handle(ptr)
        }

        fn import_handle(&self, handle: &IpcHandle) -> Result<DevicePtr> {
            if self.imports.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(Error::Device("peer mapping refused".into()));
            }
            self.inner.import_handle(handle)
        }

        fn free(&self, ptr: DevicePtr) -> Result<()> {
            self.freed.lock().push(ptr);
            Ok(())
        }
    }

    #[test]
    fn test_create_then_free_leaves_nothing_owned() {
        let handles: Vec<_> = LocalGroup::new(4)
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let rt = HostShmRuntime::new("xa2a_sb_unit");
                    let buf = SharedBuffer::create(&rt, &g, 1024).unwrap();
                    assert_eq!(buf.size(), 1024);
                    assert_eq!(buf.ptrs().len(), 4);
                    assert!(buf.ptrs().iter().all(|p| !p.is_null()));
                    assert_eq!(buf.mappings()[g.rank()], Mapping::Owned(buf.local().unwrap()));
                    let peers = buf
                        .mappings()
                        .iter()
                        .filter(|m| matches!(m, Mapping::Peer(_)))
                        .count();
                    assert_eq!(peers, 3);
                    assert_eq!(rt.owned_count(), 1);
                    // keep every peer's segment alive until all ranks have mapped it
                    g.all_gather(Vec::new()).unwrap();
                    buf.free(&rt).unwrap();
                    rt.owned_count()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 0);
        }
    }

    #[test]
    fn test_peer_writes_are_visible() {
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let rt = HostShmRuntime::new("xa2a_sb_vis");
                    let buf = SharedBuffer::create(&rt, &g, 64).unwrap();
                    let peer = 1 - g.rank();
                    unsafe { rt.bytes_mut(buf.ptrs()[peer]).unwrap()[0] = 40 + g.rank() as u8 };
                    g.all_gather(Vec::new()).unwrap();
                    let mine = unsafe { rt.bytes(buf.local().unwrap()).unwrap()[0] };
                    g.all_gather(Vec::new()).unwrap();
                    buf.free(&rt).unwrap();
                    mine
                })
            })
            .collect();
        let seen: Vec<u8> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(seen, vec![41, 40]);
    }

    #[test]
    fn test_failed_import_releases_owned_region() {
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    // rank 0 maps rank 1, then fails on rank 2
                    let rt = FailingImport {
                        inner: HostShmRuntime::new("xa2a_sb_fail"),
                        imports: AtomicUsize::new(0),
                        fail_at: if g.rank() == 0 { 1 } else { usize::MAX },
                        freed: Mutex::new(Vec::new()),
                    };
                    let result = SharedBuffer::create(&rt, &g, 256);
                    let failed = result.is_err();
                    if let Ok(buf) = result {
                        buf.free(&rt).unwrap();
                    }
                    let freed = rt.freed.lock().clone();
                    let imported = rt.inner.imported_count();

                    g.all_gather(Vec::new()).unwrap();
                    for ptr in &freed {
                        rt.inner.free(*ptr).unwrap();
                    }
                    (failed, freed.len(), imported, rt.inner.owned_count())
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // the one mapping made before the failure stays with the runtime
        assert_eq!(outcomes[0], (true, 1, 1, 0));
        assert_eq!(outcomes[1], (false, 1, 2, 0));
        assert_eq!(outcomes[2], (false, 1, 2, 0));
    }
}
