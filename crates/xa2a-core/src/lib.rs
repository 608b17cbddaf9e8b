//! xa2a - Intra-node peer-to-peer all-to-all coordination
//!
//! Decides whether a group of processes can run all-to-all over directly
//! mapped peer device memory, sets up the cross-process buffers that path
//! needs, and drives the native kernel through a plan / execute split that
//! survives graph capture and replay.

pub mod communicator;
pub mod config;
pub mod dtype;
pub mod eligibility;
pub mod error;
pub mod group;
pub mod kernel;
pub mod local_group;
pub mod negotiate;
pub mod plan;
pub mod registrar;
pub mod runtime;
pub mod shared_buffer;
pub mod shm;
pub mod tensor;
pub mod topology;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use communicator::{AllToAllComm, CaptureSession, Platform};
pub use config::{A2aConfig, ALIGNMENT, SUPPORTED_WORLD_SIZES};
pub use dtype::DType;
pub use eligibility::{block_count, should_use_fast_path, FastPathPolicy};
pub use error::{Error, Result, ShapeError};
pub use group::{Backend, ProcessGroup};
pub use kernel::{
    CaptureMetadata, ContextHandle, KernelBackend, KernelBuffers, PlanArtifact, PlanRequest,
};
pub use local_group::LocalGroup;
pub use negotiate::{Capabilities, DisableReason, Negotiation};
pub use plan::Plan;
pub use runtime::{DevicePtr, DeviceRuntime, IpcHandle};
pub use shared_buffer::{Mapping, SharedBuffer};
pub use shm::HostShmRuntime;
pub use tensor::TensorView;
pub use topology::{StaticTopology, TopologyProber};

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
