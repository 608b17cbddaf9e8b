//! POSIX shared memory runtime
//!
//! Stands in for device memory on hosts without an accelerator: regions are
//! shared memory segments, and the exported handle is the segment's OS id.

use crate::runtime::{DevicePtr, DeviceRuntime, IpcHandle};
use crate::{Error, Result};
use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared memory region wrapper
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// Safety: the mapping is process-wide; the wrapper only hands out addresses.
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;
        // Only the creator unlinks the segment.
        shmem.set_owner(false);

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }
}

static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(0);

/// [`DeviceRuntime`] over host shared memory.
///
/// Every mapping, owned or imported, is kept alive by the runtime until it
/// is freed (owned) or the runtime is dropped (imported).
pub struct HostShmRuntime {
    prefix: String,
    owned: Mutex<HashMap<u64, SharedMemory>>,
    imported: Mutex<Vec<SharedMemory>>,
}

impl HostShmRuntime {
    /// Segment names are `/{prefix}_{pid}_{n}`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            owned: Mutex::new(HashMap::new()),
            imported: Mutex::new(Vec::new()),
        }
    }

    fn segment_name(&self) -> String {
        let n = NEXT_SEGMENT.fetch_add(1, Ordering::SeqCst);
        format!("/{}_{}_{}", self.prefix, std::process::id(), n)
    }

    /// Number of regions this runtime allocated and has not freed
    pub fn owned_count(&self) -> usize {
        self.owned.lock().len()
    }

    /// Number of peer regions mapped into this process
    pub fn imported_count(&self) -> usize {
        self.imported.lock().len()
    }

    /// Byte view of a region this runtime owns or imported.
    ///
    /// # Safety
    /// Peers may write the region concurrently; the caller must order access.
    pub unsafe fn bytes(&self, ptr: DevicePtr) -> Option<&[u8]> {
        let find = |shm: &SharedMemory| (shm.as_ptr() as u64 == ptr.0).then(|| shm.size());
        let size = self
            .owned
            .lock()
            .get(&ptr.0)
            .map(|shm| shm.size())
            .or_else(|| self.imported.lock().iter().find_map(find))?;
        Some(unsafe { std::slice::from_raw_parts(ptr.0 as *const u8, size) })
    }

    /// Mutable byte view of a region this runtime owns or imported.
    ///
    /// # Safety
    /// Same contract as [`bytes`](Self::bytes); no other view may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, ptr: DevicePtr) -> Option<&mut [u8]> {
        let slice = unsafe { self.bytes(ptr)? };
        Some(unsafe { std::slice::from_raw_parts_mut(slice.as_ptr() as *mut u8, slice.len()) })
    }
}

impl DeviceRuntime for HostShmRuntime {
    fn is_available(&self) -> bool {
        true
    }

    fn device_count(&self) -> Result<usize> {
        Ok(1)
    }

    fn allocate(&self, bytes: usize) -> Result<DevicePtr> {
        let shm = SharedMemory::create(&self.segment_name(), bytes)?;
        let ptr = shm.as_ptr() as u64;
        self.owned.lock().insert(ptr, shm);
        Ok(DevicePtr(ptr))
    }

    fn export_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        let owned = self.owned.lock();
        let shm = owned
            .get(&ptr.0)
            .ok_or_else(|| Error::Device(format!("{ptr:?} is not owned by this runtime")))?;
        Ok(IpcHandle(shm.name().as_bytes().to_vec()))
    }

    fn import_handle(&self, handle: &IpcHandle) -> Result<DevicePtr> {
        let name = std::str::from_utf8(handle.as_bytes())
            .map_err(|e| Error::SharedMemory(format!("malformed segment id: {e}")))?;
        let shm = SharedMemory::open(name)?;
        let ptr = shm.as_ptr() as u64;
        self.imported.lock().push(shm);
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.owned
            .lock()
            .remove(&ptr.0)
            .map(drop)
            .ok_or_else(|| Error::Device(format!("free of unowned region {ptr:?}")))
    }
}
