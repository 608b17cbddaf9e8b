//! The all-to-all communicator
//!
//! A communicator is either enabled, holding four shared buffer families
//! and a native kernel context, or disabled, in which case every operation
//! is a no-op. Which one is decided once, at construction.

use crate::config::A2aConfig;
use crate::eligibility::{self, FastPathPolicy};
use crate::group::ProcessGroup;
use crate::kernel::{ContextHandle, KernelBackend, KernelBuffers, PlanRequest};
use crate::negotiate::{negotiate, Capabilities, DisableReason, Negotiation};
use crate::plan::{normalize, validate_plan_inputs, NormalizedSplits, Plan};
use crate::registrar;
use crate::runtime::{DevicePtr, DeviceRuntime};
use crate::shared_buffer::SharedBuffer;
use crate::tensor::TensorView;
use crate::topology::TopologyProber;
use crate::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// External collaborators a communicator is built on.
#[derive(Clone)]
pub struct Platform {
    pub runtime: Arc<dyn DeviceRuntime>,
    pub kernel: Arc<dyn KernelBackend>,
    pub topology: Arc<dyn TopologyProber>,
}

struct BufferFamilies {
    payload: SharedBuffer,
    metadata: SharedBuffer,
    barrier_in: SharedBuffer,
    barrier_out: SharedBuffer,
}

impl BufferFamilies {
    fn into_vec(self) -> Vec<SharedBuffer> {
        vec![self.payload, self.metadata, self.barrier_in, self.barrier_out]
    }
}

struct Enabled {
    caps: Capabilities,
    buffers: BufferFamilies,
    scratch: DevicePtr,
    ctx: ContextHandle,
}

enum CommState {
    Disabled(DisableReason),
    Enabled(Box<Enabled>),
    Closed,
}

/// Intra-node all-to-all over directly mapped peer memory.
///
/// Construction, [`register_graph_buffers`](Self::register_graph_buffers)
/// and capture sessions are collective over the group.
pub struct AllToAllComm {
    group: Arc<dyn ProcessGroup>,
    platform: Platform,
    config: A2aConfig,
    state: CommState,
    capturing: bool,
}

impl AllToAllComm {
    /// Negotiate and, if eligible, set up shared buffers and the kernel context.
    ///
    /// The caller binds each communicator to a distinct device, and all of
    /// the group's ranks must live on one node for the fast path to enable.
    pub fn new(
        group: Arc<dyn ProcessGroup>,
        device_index: usize,
        platform: Platform,
        config: A2aConfig,
    ) -> Result<Self> {
        let negotiation = negotiate(
            &*group,
            device_index,
            &*platform.runtime,
            &*platform.kernel,
            &*platform.topology,
            &config,
        )?;

        let state = match negotiation {
            Negotiation::Disabled(reason) => CommState::Disabled(reason),
            Negotiation::Enabled(caps) => {
                let enabled = setup(&*group, &platform, &config, caps)?;
                tracing::info!(
                    rank = enabled.caps.rank,
                    world_size = enabled.caps.world_size,
                    full_mesh = enabled.caps.full_mesh,
                    max_size = config.max_size,
                    "custom all-to-all enabled"
                );
                CommState::Enabled(Box::new(enabled))
            }
        };

        Ok(Self {
            group,
            platform,
            config,
            state,
            capturing: false,
        })
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, CommState::Enabled(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, CommState::Closed)
    }

    pub fn disable_reason(&self) -> Option<&DisableReason> {
        match &self.state {
            CommState::Disabled(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        match &self.state {
            CommState::Enabled(enabled) => Some(&enabled.caps),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<ContextHandle> {
        match &self.state {
            CommState::Enabled(enabled) => Some(enabled.ctx),
            _ => None,
        }
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn config(&self) -> &A2aConfig {
        &self.config
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// The per-call predicate's view of this communicator.
    pub fn policy(&self) -> FastPathPolicy {
        match &self.state {
            CommState::Enabled(enabled) => FastPathPolicy {
                enabled: true,
                full_mesh: enabled.caps.full_mesh,
                max_size: self.config.max_size,
            },
            _ => FastPathPolicy::DISABLED,
        }
    }

    /// True if this call may take the fast path. Always false when disabled.
    pub fn should_use_fast_path<S: Copy + Into<i64>>(
        &self,
        input: &TensorView,
        input_split_sizes: &[S],
        input_split_offsets: Option<&[S]>,
    ) -> bool {
        eligibility::should_use_fast_path(
            &self.policy(),
            input,
            input_split_sizes,
            input_split_offsets,
        )
    }

    /// Validate one call and ask the kernel for a plan.
    ///
    /// `Ok(None)` when the communicator is disabled or the call is not
    /// eligible; the caller then uses its generic collective. Shape
    /// violations on an eligible call are errors, never a fallback.
    pub fn build_plan<S: Copy + Into<i64>>(
        &self,
        output: &TensorView,
        input: &TensorView,
        output_split_sizes: &[S],
        input_split_sizes: &[S],
        output_split_offsets: Option<&[S]>,
        input_split_offsets: Option<&[S]>,
    ) -> Result<Option<Plan>> {
        let enabled = match &self.state {
            CommState::Enabled(enabled) => enabled,
            CommState::Disabled(_) => return Ok(None),
            CommState::Closed => return Err(Error::Closed),
        };
        if !self.should_use_fast_path(input, input_split_sizes, input_split_offsets) {
            return Ok(None);
        }

        let splits = NormalizedSplits {
            output_sizes: normalize(output_split_sizes),
            input_sizes: normalize(input_split_sizes),
            output_offsets: output_split_offsets.map(normalize),
            input_offsets: input_split_offsets.map(normalize),
        };
        let row_width = validate_plan_inputs(output, input, &splits, enabled.caps.world_size)?;

        let artifact = self.platform.kernel.plan(
            enabled.ctx,
            &PlanRequest {
                output,
                input,
                output_splits: &splits.output_sizes,
                input_splits: &splits.input_sizes,
                output_offsets: splits.output_offsets.as_deref(),
                input_offsets: splits.input_offsets.as_deref(),
                row_width,
            },
        )?;
        Ok(Some(Plan::new(artifact, row_width, splits)))
    }

    /// Run a previously built plan. Safe to record in a capture session:
    /// nothing here depends on shapes beyond what the plan carries.
    pub fn execute(&self, output: &TensorView, input: &TensorView, plan: &Plan) -> Result<()> {
        match &self.state {
            CommState::Enabled(enabled) => self.platform.kernel.execute(
                enabled.ctx,
                output,
                input,
                plan.artifact(),
                plan.row_width(),
            ),
            CommState::Disabled(_) => Ok(()),
            CommState::Closed => Err(Error::Closed),
        }
    }

    /// Open a capture session. Registration runs when the session ends.
    pub fn capture(&mut self) -> Result<CaptureSession<'_>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.capturing {
            return Err(Error::CaptureInProgress);
        }
        self.capturing = true;
        Ok(CaptureSession {
            comm: self,
            finished: false,
        })
    }

    /// Run `body` inside a capture session.
    ///
    /// Registration runs even if `body` fails; the body's error wins.
    pub fn with_capture<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut AllToAllComm) -> Result<T>,
    {
        let mut session = self.capture()?;
        let outcome = body(&mut session);
        let registered = session.finish();
        let value = outcome?;
        registered?;
        Ok(value)
    }

    /// Share captured buffer addresses across the group. Collective.
    pub fn register_graph_buffers(&self) -> Result<()> {
        match &self.state {
            CommState::Enabled(enabled) => {
                registrar::register_graph_buffers(&*self.group, &*self.platform.kernel, enabled.ctx)
            }
            CommState::Disabled(_) => Ok(()),
            CommState::Closed => Err(Error::Closed),
        }
    }

    fn end_capture(&mut self) -> Result<()> {
        self.capturing = false;
        if self.is_enabled() {
            self.register_graph_buffers()
        } else {
            Ok(())
        }
    }

    /// Release the kernel context and this rank's half of every buffer family.
    ///
    /// Call only once every in-flight operation on the communicator has
    /// completed. Repeated calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, CommState::Closed);
        let enabled = match state {
            CommState::Enabled(enabled) => enabled,
            CommState::Disabled(_) | CommState::Closed => return Ok(()),
        };
        let Enabled {
            caps,
            buffers,
            scratch,
            ctx,
        } = *enabled;

        let runtime = &*self.platform.runtime;
        let mut first_error = self.platform.kernel.dispose(ctx).err();
        for buffer in buffers.into_vec() {
            if let Err(e) = buffer.free(runtime) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = runtime.free(scratch) {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => {
                tracing::error!(rank = caps.rank, error = %e, "custom all-to-all teardown failed");
                Err(e)
            }
            None => {
                tracing::debug!(rank = caps.rank, "custom all-to-all closed");
                Ok(())
            }
        }
    }
}

impl Drop for AllToAllComm {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Allocate the four buffer families and the scratch region, then create
/// the kernel context. On failure everything already allocated is released.
fn setup(
    group: &dyn ProcessGroup,
    platform: &Platform,
    config: &A2aConfig,
    caps: Capabilities,
) -> Result<Enabled> {
    let runtime = &*platform.runtime;

    // Family order is part of the collective contract: every rank builds
    // payload, metadata, barrier-in, barrier-out in this order.
    let mut built: Vec<SharedBuffer> = Vec::with_capacity(4);
    for size in [
        config.max_size,
        config.peer_output_size,
        config.barrier_max_size,
        config.barrier_max_size,
    ] {
        match SharedBuffer::create(runtime, group, size) {
            Ok(buffer) => built.push(buffer),
            Err(e) => return Err(abandon(runtime, caps.rank, built, None, e)),
        }
    }

    let scratch = match runtime.allocate(config.rank_data_size) {
        Ok(ptr) => ptr,
        Err(e) => return Err(abandon(runtime, caps.rank, built, None, e)),
    };

    let [payload, metadata, barrier_in, barrier_out]: [SharedBuffer; 4] = match built.try_into() {
        Ok(families) => families,
        Err(built) => {
            let e = Error::Device(format!("expected 4 buffer families, built {}", built.len()));
            return Err(abandon(runtime, caps.rank, built, Some(scratch), e));
        }
    };

    let kernel_buffers = KernelBuffers {
        scratch,
        scratch_bytes: config.rank_data_size,
        payload: payload.ptrs(),
        metadata: metadata.ptrs(),
        barrier_in: barrier_in.ptrs(),
        barrier_out: barrier_out.ptrs(),
    };
    let buffers = BufferFamilies {
        payload,
        metadata,
        barrier_in,
        barrier_out,
    };

    let ctx = match platform
        .kernel
        .create_context(caps.rank, caps.world_size, &kernel_buffers)
    {
        Ok(ctx) => ctx,
        Err(e) => return Err(abandon(runtime, caps.rank, buffers.into_vec(), Some(scratch), e)),
    };

    Ok(Enabled {
        caps,
        buffers,
        scratch,
        ctx,
    })
}

/// Release a partially built setup and hand back the error that stopped it.
fn abandon(
    runtime: &dyn DeviceRuntime,
    rank: usize,
    built: Vec<SharedBuffer>,
    scratch: Option<DevicePtr>,
    error: Error,
) -> Error {
    tracing::error!(rank, error = %error, "custom all-to-all setup failed");
    for buffer in built {
        if let Err(e) = buffer.free(runtime) {
            tracing::warn!(rank, error = %e, "failed to release buffer family");
        }
    }
    if let Some(ptr) = scratch {
        if let Err(e) = runtime.free(ptr) {
            tracing::warn!(rank, error = %e, "failed to release scratch region");
        }
    }
    error
}

/// A capture region on a communicator.
///
/// Dereferences to the communicator so the recorded work runs through it.
/// Ending the session, by [`finish`](Self::finish) or by drop (including
/// during unwinding), clears the capturing flag and, if the communicator is
/// enabled, runs buffer registration exactly once.
pub struct CaptureSession<'a> {
    comm: &'a mut AllToAllComm,
    finished: bool,
}

impl CaptureSession<'_> {
    /// End the session and return the registration outcome.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.comm.end_capture()
    }
}

impl Deref for CaptureSession<'_> {
    type Target = AllToAllComm;

    fn deref(&self) -> &AllToAllComm {
        self.comm
    }
}

impl DerefMut for CaptureSession<'_> {
    fn deref_mut(&mut self) -> &mut AllToAllComm {
        self.comm
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.comm.end_capture() {
            tracing::error!(error = %e, "graph buffer registration failed");
        }
    }
}
