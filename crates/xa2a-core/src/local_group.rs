//! In-process process group
//!
//! Each rank is a thread holding its own [`LocalGroup`] handle. Collectives
//! rendezvous on a shared round; a round completes once every rank has
//! arrived and is recycled once every rank has left.
//!
//! Every call is tagged with its kind. If ranks disagree on the call for a
//! round (say one broadcasts from rank 1 while another all-gathers), every
//! participant fails with [`Error::Group`] instead of silently pairing
//! mismatched payloads.

use crate::group::{Backend, ProcessGroup};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    AllGather,
    Broadcast { src: usize },
}

impl CallKind {
    fn op(&self) -> &'static str {
        match self {
            CallKind::AllGather => "all_gather",
            CallKind::Broadcast { .. } => "broadcast",
        }
    }
}

type Outcome = std::result::Result<Vec<Vec<u8>>, String>;

struct Round {
    arrivals: Vec<Option<(CallKind, Vec<u8>)>>,
    arrived: usize,
    departed: usize,
    outcome: Option<Arc<Outcome>>,
}

struct Shared {
    world_size: usize,
    backend: Backend,
    nodes: Vec<String>,
    round: Mutex<Round>,
    cv: Condvar,
}

/// One rank's handle on an in-process group.
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
    issued: AtomicU64,
}

impl LocalGroup {
    /// A gloo-backed single-node group of `world_size` ranks.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        Self::with_backend(Backend::Gloo, world_size)
    }

    pub fn with_backend(backend: Backend, world_size: usize) -> Vec<LocalGroup> {
        Self::with_nodes(backend, vec!["localhost".to_string(); world_size])
    }

    /// One rank per entry of `nodes`, each reporting that node id.
    pub fn with_nodes(backend: Backend, nodes: Vec<String>) -> Vec<LocalGroup> {
        let world_size = nodes.len();
        let shared = Arc::new(Shared {
            world_size,
            backend,
            nodes,
            round: Mutex::new(Round {
                arrivals: vec![None; world_size],
                arrived: 0,
                departed: 0,
                outcome: None,
            }),
            cv: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
                issued: AtomicU64::new(0),
            })
            .collect()
    }

    /// Collectives this rank has entered so far.
    pub fn collectives_issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    fn exchange(&self, kind: CallKind, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let shared = &*self.shared;
        let mut round = shared.round.lock();

        // Previous round still draining.
        while round.outcome.is_some() {
            shared.cv.wait(&mut round);
        }

        round.arrivals[self.rank] = Some((kind, payload));
        round.arrived += 1;
        if round.arrived == shared.world_size {
            let outcome = settle(&mut round.arrivals);
            round.outcome = Some(Arc::new(outcome));
            shared.cv.notify_all();
        }

        let outcome = loop {
            if let Some(outcome) = round.outcome.clone() {
                break outcome;
            }
            shared.cv.wait(&mut round);
        };

        round.departed += 1;
        if round.departed == shared.world_size {
            round.outcome = None;
            round.arrived = 0;
            round.departed = 0;
            shared.cv.notify_all();
        }
        drop(round);

        match &*outcome {
            Ok(payloads) => Ok(payloads.clone()),
            Err(reason) => Err(Error::group(kind.op(), reason.clone())),
        }
    }
}

fn settle(arrivals: &mut [Option<(CallKind, Vec<u8>)>]) -> Outcome {
    let mut kinds = Vec::with_capacity(arrivals.len());
    let mut payloads = Vec::with_capacity(arrivals.len());
    for slot in arrivals.iter_mut() {
        let (kind, payload) = slot.take().ok_or("rank missing from completed round")?;
        kinds.push(kind);
        payloads.push(payload);
    }
    if kinds.iter().any(|k| *k != kinds[0]) {
        return Err(format!("collective mismatch across ranks: {kinds:?}"));
    }
    Ok(payloads)
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn backend(&self) -> Backend {
        self.shared.backend.clone()
    }

    fn node_id(&self) -> String {
        self.shared.nodes[self.rank].clone()
    }

    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.exchange(CallKind::AllGather, data)
    }

    fn broadcast(&self, data: Vec<u8>, src: usize) -> Result<Vec<u8>> {
        if src >= self.shared.world_size {
            return Err(Error::group(
                "broadcast",
                format!("source rank {src} outside world of {}", self.shared.world_size),
            ));
        }
        let mut payloads = self.exchange(CallKind::Broadcast { src }, data)?;
        Ok(std::mem::take(&mut payloads[src]))
    }
}
