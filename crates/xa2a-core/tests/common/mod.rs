//! Shared harness: a recording kernel, a counting runtime, and a launcher
//! that runs one closure per rank on its own thread.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use xa2a_core::{
    A2aConfig, Backend, CaptureMetadata, ContextHandle, DevicePtr, DeviceRuntime, DType, Error,
    IpcHandle, KernelBackend, KernelBuffers, LocalGroup, Platform, PlanArtifact, PlanRequest,
    Result, StaticTopology, TensorView, TopologyProber,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// Run `f` once per rank, each on its own thread, and collect results by rank.
pub fn run_ranks<T, F>(groups: Vec<LocalGroup>, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(LocalGroup) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = groups
        .into_iter()
        .map(|g| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(g))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Small buffers so host-backed tests stay cheap.
pub fn small_config() -> A2aConfig {
    A2aConfig {
        max_size: 64 * 1024,
        rank_data_size: 4096,
        ..A2aConfig::default()
    }
}

pub fn tensor(rows: usize, width: usize) -> TensorView {
    TensorView::contiguous(DevicePtr(0x9000_0000), &[rows, width], DType::BFloat16)
}

pub fn platform(
    runtime: Arc<CountingRuntime>,
    kernel: Arc<FakeKernel>,
    topology: StaticTopology,
) -> Platform {
    Platform {
        runtime,
        kernel,
        topology: Arc::new(topology) as Arc<dyn TopologyProber>,
    }
}

/// Device runtime handing out fake addresses and tracking ownership.
pub struct CountingRuntime {
    rank: usize,
    next: AtomicU64,
    owned: Mutex<HashSet<u64>>,
    allocations: AtomicUsize,
    imports: AtomicUsize,
    /// Fail the n-th allocation (0-based) and every later one.
    fail_from: Option<usize>,
    pub available: bool,
}

impl CountingRuntime {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            next: AtomicU64::new(0),
            owned: Mutex::new(HashSet::new()),
            allocations: AtomicUsize::new(0),
            imports: AtomicUsize::new(0),
            fail_from: None,
            available: true,
        }
    }

    pub fn failing_from(rank: usize, n: usize) -> Self {
        Self {
            fail_from: Some(n),
            ..Self::new(rank)
        }
    }

    /// Successful allocations over the runtime's lifetime
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Owned regions not yet freed
    pub fn outstanding(&self) -> usize {
        self.owned.lock().len()
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }
}

impl DeviceRuntime for CountingRuntime {
    fn is_available(&self) -> bool {
        self.available
    }

    fn device_count(&self) -> Result<usize> {
        Ok(8)
    }

    fn allocate(&self, _bytes: usize) -> Result<DevicePtr> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|limit| n as usize >= limit) {
            return Err(Error::Device("out of memory".into()));
        }
        let ptr = ((self.rank as u64 + 1) << 40) | ((n + 1) << 20);
        self.owned.lock().insert(ptr);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(DevicePtr(ptr))
    }

    fn export_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        Ok(IpcHandle(ptr.0.to_le_bytes().to_vec()))
    }

    fn import_handle(&self, handle: &IpcHandle) -> Result<DevicePtr> {
        let bytes: [u8; 8] = handle
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Device("bad handle".into()))?;
        self.imports.fetch_add(1, Ordering::SeqCst);
        // Mapped at a different address than the owner sees it.
        Ok(DevicePtr(u64::from_le_bytes(bytes) | (1 << 63)))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        if self.owned.lock().remove(&ptr.0) {
            Ok(())
        } else {
            Err(Error::Device(format!("double free of {ptr:?}")))
        }
    }
}

/// Native kernel stand-in that records every call.
pub struct FakeKernel {
    pub available: bool,
    pub supports_all_to_all: bool,
    pub buffers: Mutex<Option<KernelBuffers>>,
    /// (output ptr, input ptr) of every executed plan
    pub executed: Mutex<Vec<(u64, u64)>>,
    pub registered: Mutex<Vec<(Vec<Vec<u8>>, Vec<Vec<i64>>)>>,
    pub disposed: Mutex<Vec<ContextHandle>>,
    pub plans: AtomicUsize,
    rank: usize,
}

impl FakeKernel {
    pub fn new(rank: usize) -> Self {
        Self {
            available: true,
            supports_all_to_all: true,
            buffers: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            disposed: Mutex::new(Vec::new()),
            plans: AtomicUsize::new(0),
            rank,
        }
    }

    pub fn unavailable(rank: usize) -> Self {
        Self {
            available: false,
            ..Self::new(rank)
        }
    }
}

impl KernelBackend for FakeKernel {
    fn is_available(&self) -> bool {
        self.available
    }

    fn supports_all_to_all(&self) -> bool {
        self.supports_all_to_all
    }

    fn create_context(
        &self,
        rank: usize,
        _world_size: usize,
        buffers: &KernelBuffers,
    ) -> Result<ContextHandle> {
        *self.buffers.lock() = Some(buffers.clone());
        Ok(ContextHandle(0xc0de_0000 + rank as u64))
    }

    fn capture_buffer_metadata(&self, _ctx: ContextHandle) -> Result<CaptureMetadata> {
        let executed = self.executed.lock();
        let mut meta = CaptureMetadata::default();
        for &(output, input) in executed.iter() {
            for addr in [output, input] {
                meta.handles.extend(std::iter::repeat(self.rank as u8).take(64));
                meta.offsets.push((addr & 0xffff) as i64);
            }
        }
        Ok(meta)
    }

    fn register_capture_buffers(
        &self,
        _ctx: ContextHandle,
        handles: &[Vec<u8>],
        offsets: &[Vec<i64>],
    ) -> Result<()> {
        self.registered
            .lock()
            .push((handles.to_vec(), offsets.to_vec()));
        Ok(())
    }

    fn plan(&self, _ctx: ContextHandle, request: &PlanRequest<'_>) -> Result<PlanArtifact> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        let mut bytes = Vec::new();
        for v in request.output_splits.iter().chain(request.input_splits) {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Ok(PlanArtifact(bytes))
    }

    fn execute(
        &self,
        _ctx: ContextHandle,
        output: &TensorView,
        input: &TensorView,
        _plan: &PlanArtifact,
        _row_width: usize,
    ) -> Result<()> {
        self.executed
            .lock()
            .push((output.ptr.as_u64(), input.ptr.as_u64()));
        Ok(())
    }

    fn dispose(&self, ctx: ContextHandle) -> Result<()> {
        self.disposed.lock().push(ctx);
        Ok(())
    }
}

pub fn groups(world_size: usize) -> Vec<LocalGroup> {
    LocalGroup::with_backend(Backend::Gloo, world_size)
}
