//! Per-call fast-path eligibility

use crate::config::ALIGNMENT;
use crate::tensor::TensorView;

/// The negotiated facts the per-call predicate depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastPathPolicy {
    pub enabled: bool,
    pub full_mesh: bool,
    /// Traffic must stay strictly below this many bytes
    pub max_size: usize,
}

impl FastPathPolicy {
    pub const DISABLED: FastPathPolicy = FastPathPolicy {
        enabled: false,
        full_mesh: false,
        max_size: 0,
    };
}

/// Rows the input actually sends.
///
/// Without offsets the splits are packed back to back, so the count is
/// their sum. With offsets it is the furthest row any split reaches.
/// `None` if the count does not fit in `i64`.
pub fn block_count<S: Copy + Into<i64>>(sizes: &[S], offsets: Option<&[S]>) -> Option<i64> {
    match offsets {
        None => sizes
            .iter()
            .try_fold(0i64, |acc, &s| acc.checked_add(s.into())),
        Some(offsets) => {
            let mut furthest: Option<i64> = None;
            for (&off, &len) in offsets.iter().zip(sizes) {
                let end = off.into().checked_add(len.into())?;
                furthest = Some(furthest.map_or(end, |f| f.max(end)));
            }
            Some(furthest.unwrap_or(0))
        }
    }
}

/// Bytes the call will move.
///
/// The raw footprint is used unless it already reaches `max_size`, in which
/// case the tighter split-derived bound is computed: inputs are often
/// over-allocated and only partly sent. `None` when the size cannot be
/// represented, including a negative row count.
pub fn effective_size<S: Copy + Into<i64>>(
    input: &TensorView,
    max_size: usize,
    split_sizes: &[S],
    split_offsets: Option<&[S]>,
) -> Option<usize> {
    let raw = input.byte_size()?;
    if raw < max_size {
        return Some(raw);
    }
    let rows = usize::try_from(block_count(split_sizes, split_offsets)?).ok()?;
    rows.checked_mul(input.row_bytes()?)
}

/// Decide whether this call may take the direct peer-memory path.
///
/// Sizes that overflow are never eligible.
pub fn should_use_fast_path<S: Copy + Into<i64>>(
    policy: &FastPathPolicy,
    input: &TensorView,
    split_sizes: &[S],
    split_offsets: Option<&[S]>,
) -> bool {
    if !policy.enabled {
        return false;
    }
    match input.byte_size() {
        Some(bytes) if bytes % ALIGNMENT == 0 => {}
        _ => return false,
    }
    if !input.is_weak_contiguous() {
        return false;
    }
    // Two-rank PCIe groups pass negotiation but still never take this path.
    if !policy.full_mesh {
        return false;
    }
    effective_size(input, policy.max_size, split_sizes, split_offsets)
        .is_some_and(|size| size < policy.max_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::runtime::DevicePtr;

    const MESH: FastPathPolicy = FastPathPolicy {
        enabled: true,
        full_mesh: true,
        max_size: 1 << 20,
    };

    fn input(rows: usize, width: usize, dtype: DType) -> TensorView {
        TensorView::contiguous(DevicePtr(0x7000_0000), &[rows, width], dtype)
    }

    #[test]
    fn test_block_count_with_and_without_offsets() {
        assert_eq!(block_count(&[4i64, 4, 4, 4], None), Some(16));
        assert_eq!(
            block_count(&[4i64, 5, 4, 3], Some(&[0i64, 4, 9, 13][..])),
            Some(16)
        );
        assert_eq!(block_count::<i64>(&[], None), Some(0));
    }

    #[test]
    fn test_block_count_offsets_match_packed_sum() {
        // Non-overlapping packed splits reach exactly as far as their sum.
        let sizes = [7i64, 0, 12, 3, 9, 1];
        let mut offsets = Vec::new();
        let mut at = 0;
        for s in sizes {
            offsets.push(at);
            at += s;
        }
        assert_eq!(
            block_count(&sizes, Some(offsets.as_slice())),
            block_count(&sizes, None)
        );
    }

    #[test]
    fn test_misaligned_input_is_rejected() {
        // 3 x 5 bytes = 15, 17 x 1 byte = 17
        assert!(!should_use_fast_path(&MESH, &input(3, 5, DType::UInt8), &[1i64, 2], None));
        assert!(!should_use_fast_path(&MESH, &input(17, 1, DType::Int8), &[9i64, 8], None));
        assert!(should_use_fast_path(&MESH, &input(4, 4, DType::UInt8), &[2i64, 2], None));
    }

    #[test]
    fn test_requires_full_mesh() {
        let pcie = FastPathPolicy {
            full_mesh: false,
            ..MESH
        };
        assert!(!should_use_fast_path(&pcie, &input(4, 8, DType::Float16), &[2i64, 2], None));
        let t = input(4, 8, DType::Float16);
        assert!(!should_use_fast_path(&FastPathPolicy::DISABLED, &t, &[2i64, 2], None));
    }

    #[test]
    fn test_non_contiguous_input_is_rejected() {
        let mut t = input(8, 8, DType::Float32);
        t.shape = vec![8, 4];
        t.strides = vec![8, 1];
        assert!(!should_use_fast_path(&MESH, &t, &[4i64, 4], None));
    }

    #[test]
    fn test_oversized_buffer_uses_split_bound() {
        let policy = FastPathPolicy {
            max_size: 4096,
            ..MESH
        };
        // 64 rows x 64 bytes = 4096 raw, only 16 rows sent
        let t = input(64, 32, DType::BFloat16);
        assert_eq!(effective_size(&t, policy.max_size, &[8i64, 8], None), Some(1024));
        assert!(should_use_fast_path(&policy, &t, &[8i64, 8], None));
        // offsets reaching row 64 bring the bound back to the full buffer
        assert!(!should_use_fast_path(&policy, &t, &[8i64, 8], Some(&[0i64, 56][..])));
    }

    #[test]
    fn test_small_input_uses_raw_size() {
        let t = input(4, 8, DType::Float32);
        // splits claiming more rows than exist are irrelevant below the bound
        assert_eq!(effective_size(&t, MESH.max_size, &[1_000_000i64], None), Some(128));
    }

    #[test]
    fn test_block_count_overflow() {
        assert_eq!(block_count(&[i64::MAX, 1], None), None);
        assert_eq!(block_count(&[1i64], Some(&[i64::MAX][..])), None);
        assert_eq!(block_count(&[i64::MAX], Some(&[0i64][..])), Some(i64::MAX));
    }

    #[test]
    fn test_overflowing_splits_are_not_admitted() {
        let policy = FastPathPolicy {
            max_size: 4096,
            ..MESH
        };
        // raw size reaches the bound, so the splits decide
        let t = input(64, 32, DType::BFloat16);
        assert_eq!(effective_size(&t, policy.max_size, &[i64::MAX, 2], None), None);
        assert!(!should_use_fast_path(&policy, &t, &[i64::MAX, 2], None));
        assert!(!should_use_fast_path(&policy, &t, &[1i64, 1], Some(&[i64::MAX, 0][..])));
        // a negative row count is not a small one
        assert_eq!(block_count(&[-8i64, 8], Some(&[0i64, -64][..])), Some(-8));
        assert!(!should_use_fast_path(&policy, &t, &[-8i64, 8], Some(&[0i64, -64][..])));
        assert!(!should_use_fast_path(&policy, &t, &[-8i64, -8], None));
    }

    #[test]
    fn test_overflowing_shape_is_not_admitted() {
        let huge = input(1 << 33, 1 << 33, DType::UInt8);
        assert_eq!(effective_size(&huge, MESH.max_size, &[1i64, 1], None), None);
        assert!(!should_use_fast_path(&MESH, &huge, &[1i64, 1], None));
    }
}
