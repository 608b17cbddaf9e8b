//! Capability negotiation
//!
//! Runs once per communicator, in lockstep on every rank. The first failing
//! check disables the fast path; only a network-transport group is a hard
//! error. Nothing is allocated here.

use crate::config::{A2aConfig, SUPPORTED_WORLD_SIZES};
use crate::group::{all_gather_object, in_same_node, ProcessGroup};
use crate::kernel::KernelBackend;
use crate::runtime::DeviceRuntime;
use crate::topology::{resolve_physical_device, TopologyProber};
use crate::{Error, Result};
use std::fmt;

/// Why the fast path is off for this communicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    /// `XA2A_DISABLE` or `A2aConfig::disabled`
    KillSwitch,
    KernelLibraryMissing,
    NoAcceleratorRuntime,
    AllToAllUnsupported,
    MultiNode,
    SingleRank,
    UnsupportedWorldSize(usize),
    /// More than two devices without a full-mesh interconnect
    PcieOnly { world_size: usize },
    NoPeerAccess,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::KillSwitch => f.write_str("disabled by configuration"),
            DisableReason::KernelLibraryMissing => f.write_str("native kernel library not found"),
            DisableReason::NoAcceleratorRuntime => f.write_str("no accelerator runtime available"),
            DisableReason::AllToAllUnsupported => {
                f.write_str("installed kernel library lacks all-to-all support")
            }
            DisableReason::MultiNode => f.write_str("process group spans across nodes"),
            DisableReason::SingleRank => f.write_str("single-rank group"),
            DisableReason::UnsupportedWorldSize(n) => write!(
                f,
                "unsupported world size {n}, supported world sizes: {SUPPORTED_WORLD_SIZES:?}"
            ),
            DisableReason::PcieOnly { world_size } => write!(
                f,
                "not supported on more than two PCIe-only devices (world size {world_size})"
            ),
            DisableReason::NoPeerAccess => f.write_str("platform lacks device P2P capability"),
        }
    }
}

/// Facts established by a successful negotiation. Immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub rank: usize,
    pub world_size: usize,
    pub full_mesh: bool,
    pub peer_access: bool,
    /// Physical device id of every rank, indexed by rank
    pub physical_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Enabled(Capabilities),
    Disabled(DisableReason),
}

impl Negotiation {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Negotiation::Enabled(_))
    }
}

fn disabled(reason: DisableReason) -> Result<Negotiation> {
    match reason {
        DisableReason::KernelLibraryMissing | DisableReason::SingleRank => {
            tracing::debug!(%reason, "custom all-to-all disabled")
        }
        _ => tracing::warn!(%reason, "custom all-to-all disabled"),
    }
    Ok(Negotiation::Disabled(reason))
}

/// Decide whether this group may use the direct peer-memory path.
///
/// Collective: the locality check and the physical-id gather run on every
/// rank that gets past the environment checks, even when a later check
/// disables. Environment checks must give the same answer on every rank.
pub fn negotiate<G>(
    group: &G,
    device_index: usize,
    runtime: &dyn DeviceRuntime,
    kernel: &dyn KernelBackend,
    topology: &dyn TopologyProber,
    config: &A2aConfig,
) -> Result<Negotiation>
where
    G: ProcessGroup + ?Sized,
{
    if config.disabled {
        return disabled(DisableReason::KillSwitch);
    }
    if !kernel.is_available() {
        return disabled(DisableReason::KernelLibraryMissing);
    }
    if !runtime.is_available() {
        return disabled(DisableReason::NoAcceleratorRuntime);
    }
    if !kernel.supports_all_to_all() {
        return disabled(DisableReason::AllToAllUnsupported);
    }

    let backend = group.backend();
    if backend.is_network_transport() {
        return Err(Error::Setup(format!(
            "custom all-to-all must be attached to a non-network-transport group, got {backend}"
        )));
    }

    if !in_same_node(group)? {
        return disabled(DisableReason::MultiNode);
    }

    let rank = group.rank();
    let world_size = group.world_size();
    if world_size == 1 {
        return disabled(DisableReason::SingleRank);
    }
    if !SUPPORTED_WORLD_SIZES.contains(&world_size) {
        return disabled(DisableReason::UnsupportedWorldSize(world_size));
    }

    // Every rank enters the gather, even one that failed to resolve its id,
    // so a misconfigured rank fails the whole group instead of hanging it.
    let local_id = runtime.device_count().and_then(|count| {
        resolve_physical_device(device_index, config.visible_devices.as_deref(), count)
    });
    let local_error = local_id.as_ref().err().map(ToString::to_string);
    let gathered: Vec<Option<u32>> = all_gather_object(group, &local_id.ok())?;
    let physical_ids = match gathered.iter().copied().collect::<Option<Vec<u32>>>() {
        Some(ids) => ids,
        None => {
            let failed: Vec<usize> = gathered
                .iter()
                .enumerate()
                .filter_map(|(r, id)| id.is_none().then_some(r))
                .collect();
            return Err(Error::Setup(format!(
                "physical device resolution failed on ranks {failed:?}{}",
                local_error.map(|e| format!(" (local: {e})")).unwrap_or_default()
            )));
        }
    };
    tracing::debug!(rank, ?physical_ids, "resolved physical devices");

    let full_mesh = topology.is_full_mesh(&physical_ids)?;
    if world_size > 2 && !full_mesh {
        return disabled(DisableReason::PcieOnly { world_size });
    }

    let peer_access = topology.can_p2p(rank, world_size)?;
    if !peer_access {
        return disabled(DisableReason::NoPeerAccess);
    }

    Ok(Negotiation::Enabled(Capabilities {
        rank,
        world_size,
        full_mesh,
        peer_access,
        physical_ids,
    }))
}
