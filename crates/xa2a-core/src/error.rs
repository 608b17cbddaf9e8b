//! Error types for xa2a
//!
//! Soft ineligibility is not an error: it is reported as a
//! [`DisableReason`](crate::negotiate::DisableReason) and the communicator
//! degrades to a no-op. Everything here fails loudly.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("setup contract violated: {0}")]
    Setup(String),

    #[error("invalid all-to-all shape: {0}")]
    Shape(#[from] ShapeError),

    #[error("device runtime error: {0}")]
    Device(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("{op} failed on the process group: {reason}")]
    Group { op: &'static str, reason: String },

    #[error("native kernel error: {0}")]
    Kernel(String),

    #[error("metadata codec error: {0}")]
    Codec(String),

    #[error("a capture session is already open on this communicator")]
    CaptureInProgress,

    #[error("communicator already closed")]
    Closed,

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(String),
}

/// Plan-building contract violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{which} must have exactly world_size={world_size} entries, got {actual}")]
    SplitLength {
        which: &'static str,
        world_size: usize,
        actual: usize,
    },

    #[error("{which} entry {index} is negative: {value}")]
    NegativeSplit {
        which: &'static str,
        index: usize,
        value: i64,
    },

    #[error("{which} must be a 2D tensor, got shape {shape:?}")]
    TensorRank {
        which: &'static str,
        shape: Vec<usize>,
    },

    #[error("output and input must have the same last dimension, got {output} and {input}")]
    RowWidthMismatch { output: usize, input: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn group(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Group {
            op,
            reason: reason.into(),
        }
    }
}
