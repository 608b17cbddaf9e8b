//! Process group surface consumed during bootstrap
//!
//! Every collective here is blocking and symmetric: all ranks must issue
//! the same calls, the same number of times, in the same order. A rank that
//! skips a call leaves the others waiting forever. No timeout is imposed;
//! callers guarantee symmetric control flow across ranks.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Transport backing a process group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// CPU / TCP collectives
    Gloo,
    /// Network-transport device collectives
    Nccl,
    Other(String),
}

impl Backend {
    /// True for backends that move data over the device network transport.
    pub fn is_network_transport(&self) -> bool {
        matches!(self, Backend::Nccl)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Gloo => f.write_str("gloo"),
            Backend::Nccl => f.write_str("nccl"),
            Backend::Other(name) => f.write_str(name),
        }
    }
}

/// A fixed set of cooperating processes.
pub trait ProcessGroup {
    /// This process's rank, `0 <= rank < world_size`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn backend(&self) -> Backend;

    /// Locality key; ranks on the same node report the same id.
    fn node_id(&self) -> String;

    /// Gather every rank's bytes, indexed by rank. Collective.
    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Receive `src`'s bytes. Non-source ranks' `data` is ignored. Collective.
    fn broadcast(&self, data: Vec<u8>, src: usize) -> Result<Vec<u8>>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(value)
}

/// Typed all-gather. Collective.
pub fn all_gather_object<G, T>(group: &G, value: &T) -> Result<Vec<T>>
where
    G: ProcessGroup + ?Sized,
    T: Serialize + DeserializeOwned,
{
    group
        .all_gather(encode(value)?)?
        .iter()
        .map(|bytes| decode(bytes))
        .collect()
}

/// Typed broadcast from `src`. Collective.
pub fn broadcast_object<G, T>(group: &G, value: &T, src: usize) -> Result<T>
where
    G: ProcessGroup + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let payload = if group.rank() == src {
        encode(value)?
    } else {
        Vec::new()
    };
    decode(&group.broadcast(payload, src)?)
}

/// True if every member reports rank 0's node id. Collective.
pub fn in_same_node<G: ProcessGroup + ?Sized>(group: &G) -> Result<bool> {
    let nodes: Vec<String> = all_gather_object(group, &group.node_id())?;
    Ok(nodes.iter().all(|n| Some(n) == nodes.first()))
}
