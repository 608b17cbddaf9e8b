//! Native all-to-all kernel surface
//!
//! The byte shuffle itself runs in a native library. This crate only
//! creates its context, feeds it plans, and keeps its capture-time address
//! table consistent across ranks.

use crate::runtime::DevicePtr;
use crate::tensor::TensorView;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Opaque handle to a native kernel context. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Pointer arrays the kernel context is built from, each indexed by rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBuffers {
    /// Locally owned scratch region
    pub scratch: DevicePtr,
    pub scratch_bytes: usize,
    pub payload: Vec<DevicePtr>,
    pub metadata: Vec<DevicePtr>,
    pub barrier_in: Vec<DevicePtr>,
    pub barrier_out: Vec<DevicePtr>,
}

/// Addresses the kernel used while a capture session was recording.
///
/// `handles` is the kernel's concatenated IPC handle blob; `offsets` holds
/// one byte offset per captured address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub handles: Vec<u8>,
    pub offsets: Vec<i64>,
}

/// Kernel-ready description of one all-to-all call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanArtifact(pub Vec<u8>);

/// Normalised arguments of a planning call.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub output: &'a TensorView,
    pub input: &'a TensorView,
    pub output_splits: &'a [i64],
    pub input_splits: &'a [i64],
    pub output_offsets: Option<&'a [i64]>,
    pub input_offsets: Option<&'a [i64]>,
    pub row_width: usize,
}

/// Entry points of the native fast-path library.
pub trait KernelBackend {
    /// The native library is loadable in this environment.
    fn is_available(&self) -> bool;

    /// The installed library version ships the all-to-all entry points.
    fn supports_all_to_all(&self) -> bool;

    fn create_context(
        &self,
        rank: usize,
        world_size: usize,
        buffers: &KernelBuffers,
    ) -> Result<ContextHandle>;

    fn capture_buffer_metadata(&self, ctx: ContextHandle) -> Result<CaptureMetadata>;

    /// Register every rank's capture metadata, indexed by rank.
    fn register_capture_buffers(
        &self,
        ctx: ContextHandle,
        handles: &[Vec<u8>],
        offsets: &[Vec<i64>],
    ) -> Result<()>;

    fn plan(&self, ctx: ContextHandle, request: &PlanRequest<'_>) -> Result<PlanArtifact>;

    fn execute(
        &self,
        ctx: ContextHandle,
        output: &TensorView,
        input: &TensorView,
        plan: &PlanArtifact,
        row_width: usize,
    ) -> Result<()>;

    fn dispose(&self, ctx: ContextHandle) -> Result<()>;
}
