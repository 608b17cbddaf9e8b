//! Device memory runtime surface
//!
//! The coordination layer allocates, exports, imports and frees regions;
//! it never reads or writes their contents.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A device (or host-mapped) address, valid in the calling process only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// Opaque cross-process handle to an exported region.
///
/// For CUDA this is the 64-byte `cudaIpcMemHandle_t`; for host shared
/// memory it is the segment's OS id.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpcHandle(pub Vec<u8>);

impl IpcHandle {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpcHandle({} bytes)", self.0.len())
    }
}


/// Allocate / export / import / free primitives of a device runtime.
///
/// Implementations are bound to one device of the calling process.
pub trait DeviceRuntime {
    /// True if a compatible accelerator runtime is present.
    fn is_available(&self) -> bool;

    /// Number of devices visible to this process.
    fn device_count(&self) -> Result<usize>;

    /// Allocate `bytes` of device memory owned by this process.
    fn allocate(&self, bytes: usize) -> Result<DevicePtr>;

    /// Export a handle other processes can import.
    fn export_handle(&self, ptr: DevicePtr) -> Result<IpcHandle>;

    /// Map a peer's exported region into this process.
    fn import_handle(&self, handle: &IpcHandle) -> Result<DevicePtr>;

    /// Release a region this process allocated. Never called on imports.
    fn free(&self, ptr: DevicePtr) -> Result<()>;
}
