//! Non-owning tensor descriptions

use crate::dtype::DType;
use crate::runtime::DevicePtr;

/// Layout of a device tensor as seen by the coordination layer.
///
/// The layer never touches the contents; it only reads addresses, shape
/// and strides to decide eligibility and to hand the tensor to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorView {
    /// Address of the first element (storage base + storage offset)
    pub ptr: DevicePtr,
    /// Shape
    pub shape: Vec<usize>,
    /// Strides in elements
    pub strides: Vec<usize>,
    /// Storage offset in elements
    pub storage_offset: usize,
    /// Total byte length of the backing storage
    pub storage_bytes: usize,
    /// Element type
    pub dtype: DType,
}

impl TensorView {
    /// A row-major contiguous tensor that owns its whole storage.
    pub fn contiguous(ptr: DevicePtr, shape: &[usize], dtype: DType) -> Self {
        let mut t = Self {
            ptr,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            storage_offset: 0,
            storage_bytes: 0,
            dtype,
        };
        t.storage_bytes = t.byte_size().unwrap_or(usize::MAX);
        t
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements, `None` if it does not fit in `usize`
    pub fn numel(&self) -> Option<usize> {
        checked_product(&self.shape)
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size()
    }

    /// Logical byte footprint, `numel * element_size`
    pub fn byte_size(&self) -> Option<usize> {
        self.numel()?.checked_mul(self.element_size())
    }

    /// Width of the last dimension, the unit the kernel moves per row
    pub fn row_width(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Bytes of one leading-dimension row (`t[0].numel() * element_size`)
    pub fn row_bytes(&self) -> Option<usize> {
        let per_row = checked_product(self.shape.get(1..).unwrap_or_default())?;
        per_row.checked_mul(self.element_size())
    }

    /// Exact row-major contiguity. Size-1 dims may carry any stride.
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }
        let mut expected = 1usize;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected = match expected.checked_mul(dim) {
                Some(next) => next,
                None => return false,
            };
        }
        true
    }

    /// Contiguous, or unit-stride rows whose storage from the offset onward
    /// holds exactly this tensor's bytes with no gaps.
    pub fn is_weak_contiguous(&self) -> bool {
        if self.is_contiguous() {
            return true;
        }
        if self.strides.last().is_some_and(|&s| s != 1) {
            return false;
        }
        let (Some(offset_bytes), Some(bytes)) = (
            self.storage_offset.checked_mul(self.element_size()),
            self.byte_size(),
        ) else {
            return false;
        };
        self.storage_bytes
            .checked_sub(offset_bytes)
            .is_some_and(|tail| tail == bytes)
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].saturating_mul(shape[i + 1]);
    }
    strides
}

fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}
