//! Hardware topology probes and physical device resolution

use crate::{Error, Result};

/// Interconnect probes. The probing itself lives outside this crate.
pub trait TopologyProber {
    /// True if every pair of `physical_ids` shares a high-bandwidth direct link.
    fn is_full_mesh(&self, physical_ids: &[u32]) -> Result<bool>;

    /// True if `rank` can directly access every peer's device memory.
    fn can_p2p(&self, rank: usize, world_size: usize) -> Result<bool>;
}

/// Prober with fixed answers, for hosts whose topology is known up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticTopology {
    pub full_mesh: bool,
    pub peer_access: bool,
}

impl StaticTopology {
    /// NVLink-class full mesh with working peer access.
    pub const FULL_MESH: StaticTopology = StaticTopology {
        full_mesh: true,
        peer_access: true,
    };

    /// PCIe-only: peer access works, no mesh.
    pub const PCIE: StaticTopology = StaticTopology {
        full_mesh: false,
        peer_access: true,
    };
}

impl TopologyProber for StaticTopology {
    fn is_full_mesh(&self, _physical_ids: &[u32]) -> Result<bool> {
        Ok(self.full_mesh)
    }

    fn can_p2p(&self, _rank: usize, _world_size: usize) -> Result<bool> {
        Ok(self.peer_access)
    }
}

/// Map a logical device index to the physical device id the probes expect.
///
/// With a visible-device list the index selects from it; otherwise the
/// index must be below `device_count` and is its own physical id.
pub fn resolve_physical_device(
    logical: usize,
    visible: Option<&[u32]>,
    device_count: usize,
) -> Result<u32> {
    match visible {
        Some(ids) => ids.get(logical).copied().ok_or_else(|| {
            Error::Setup(format!(
                "device index {logical} outside visible devices {ids:?}"
            ))
        }),
        None if logical < device_count => Ok(logical as u32),
        None => Err(Error::Setup(format!(
            "device index {logical} outside {device_count} visible devices"
        ))),
    }
}
