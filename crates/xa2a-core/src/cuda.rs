//! CUDA driver runtime with IPC support

use crate::runtime::{DevicePtr, DeviceRuntime, IpcHandle};
use crate::{Error, Result};
use cudarc::driver::CudaDevice;
use std::sync::Arc;

/// CUDA IPC memory handle size
pub const CUDA_IPC_HANDLE_SIZE: usize = 64;

/// CUDA IPC memory handle (64 bytes)
#[derive(Clone, Copy)]
#[repr(C)]
struct CudaIpcHandle {
    reserved: [u8; CUDA_IPC_HANDLE_SIZE],
}

impl Default for CudaIpcHandle {
    fn default() -> Self {
        Self {
            reserved: [0u8; CUDA_IPC_HANDLE_SIZE],
        }
    }
}

/// [`DeviceRuntime`] bound to one CUDA device through the driver API
pub struct CudaRuntime {
    device: Option<Arc<CudaDevice>>,
    device_id: usize,
}

impl CudaRuntime {
    /// Bind to `device_id`. A missing driver yields an unavailable runtime,
    /// not an error, so negotiation can soft-disable.
    pub fn new(device_id: usize) -> Self {
        let device = match CudaDevice::new(device_id) {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::debug!(device_id, error = %e, "CUDA device unavailable");
                None
            }
        };
        Self { device, device_id }
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    fn bind(&self) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::Cuda(format!("device {} not initialised", self.device_id)))?;
        device.bind_to_thread().map_err(|e| Error::Cuda(e.to_string()))
    }

    /// Get IPC handle from device pointer (using CUDA driver API)
    fn get_ipc_handle(ptr: u64) -> Result<CudaIpcHandle> {
        let mut handle = CudaIpcHandle::default();

        unsafe {
            let result = cudarc::driver::sys::cuIpcGetMemHandle(
                handle.reserved.as_mut_ptr() as *mut _,
                ptr,
            );
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Cuda(format!("cuIpcGetMemHandle failed: {:?}", result)));
            }
        }

        Ok(handle)
    }

    /// Open IPC handle (using CUDA driver API)
    fn open_ipc_handle(handle: &CudaIpcHandle) -> Result<u64> {
        let mut ptr: u64 = 0;

        unsafe {
            let result = cudarc::driver::sys::cuIpcOpenMemHandle(
                &mut ptr as *mut u64 as *mut _,
                *(handle.reserved.as_ptr() as *const _),
                cudarc::driver::sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS,
            );
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Cuda(format!("cuIpcOpenMemHandle failed: {:?}", result)));
            }
        }

        Ok(ptr)
    }
}

impl DeviceRuntime for CudaRuntime {
    fn is_available(&self) -> bool {
        self.device.is_some()
    }

    fn device_count(&self) -> Result<usize> {
        CudaDevice::count()
            .map(|n| n as usize)
            .map_err(|e| Error::Cuda(e.to_string()))
    }

    fn allocate(&self, bytes: usize) -> Result<DevicePtr> {
        self.bind()?;
        let mut ptr: u64 = 0;
        unsafe {
            let result = cudarc::driver::sys::cuMemAlloc_v2(&mut ptr as *mut u64 as *mut _, bytes);
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Cuda(format!("cuMemAlloc({bytes}) failed: {:?}", result)));
            }
            // The kernel expects zeroed barrier flags on first use.
            let result = cudarc::driver::sys::cuMemsetD8_v2(ptr, 0, bytes);
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Cuda(format!("cuMemsetD8 failed: {:?}", result)));
            }
        }
        Ok(DevicePtr(ptr))
    }

    fn export_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        self.bind()?;
        let handle = Self::get_ipc_handle(ptr.0)?;
        Ok(IpcHandle(handle.reserved.to_vec()))
    }

    fn import_handle(&self, handle: &IpcHandle) -> Result<DevicePtr> {
        self.bind()?;
        let bytes: [u8; CUDA_IPC_HANDLE_SIZE] = handle.as_bytes().try_into().map_err(|_| {
            Error::Cuda(format!(
                "IPC handle must be {CUDA_IPC_HANDLE_SIZE} bytes, got {}",
                handle.as_bytes().len()
            ))
        })?;
        let ptr = Self::open_ipc_handle(&CudaIpcHandle { reserved: bytes })?;
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.bind()?;
        unsafe {
            let result = cudarc::driver::sys::cuMemFree_v2(ptr.0);
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                return Err(Error::Cuda(format!("cuMemFree failed: {:?}", result)));
            }
        }
        Ok(())
    }
}

// Safety: CudaRuntime can be sent between threads
// CUDA operations are thread-safe when using the driver API
unsafe impl Send for CudaRuntime {}
unsafe impl Sync for CudaRuntime {}
