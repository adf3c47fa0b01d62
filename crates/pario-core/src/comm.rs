//! Group communication interface
//!
//! The open protocol only needs a handful of collectives. [`Communicator`]
//! names them; [`LocalComm`] implements them for ranks that are threads of
//! one process.

use crate::hints::HintSet;
use std::sync::{Arc, Barrier, Mutex, PoisonError};

/// Reduction operator for [`Communicator::allreduce_i32`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
}

impl ReduceOp {
    fn apply(self, a: i32, b: i32) -> i32 {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

/// Host name of every rank of a group, indexed by rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameArray {
    names: Vec<String>,
}

impl NameArray {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Host name of `rank`
    pub fn name(&self, rank: usize) -> Option<&str> {
        self.names.get(rank).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A group of processes that call collectives together
///
/// Every collective must be called by all members in the same order; each one
/// blocks until all members have arrived.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> i32;

    fn size(&self) -> i32;

    /// Name of the host this rank runs on
    fn processor_name(&self) -> String;

    /// Attributes advertised by the communicator
    fn info(&self) -> HintSet;

    fn allreduce_i32(&self, value: i32, op: ReduceOp) -> i32;

    /// Broadcast `data` from `root`; the argument is ignored on other ranks
    fn bcast(&self, root: i32, data: Vec<u8>) -> Vec<u8>;

    /// Gather one buffer from every rank, indexed by rank
    fn allgather(&self, data: Vec<u8>) -> Vec<Vec<u8>>;

    /// Name array cached on this communicator by an earlier gather
    fn cached_name_array(&self) -> Option<Arc<NameArray>>;

    fn cache_name_array(&self, names: Arc<NameArray>);
}

/// Broadcast a rank list from `root`
pub fn bcast_ranks(comm: &dyn Communicator, root: i32, ranks: &[i32]) -> Vec<i32> {
    let bytes = ranks.iter().flat_map(|r| r.to_le_bytes()).collect();
    comm.bcast(root, bytes)
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Broadcast a status code and an opaque payload from `root`
pub fn bcast_status(comm: &dyn Communicator, root: i32, code: i32, payload: &[u8]) -> (i32, Vec<u8>) {
    let mut bytes = code.to_le_bytes().to_vec();
    bytes.extend_from_slice(payload);
    let bytes = comm.bcast(root, bytes);
    if bytes.len() < 4 {
        return (crate::error::ErrorClass::Other.code(), Vec::new());
    }
    let code = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (code, bytes[4..].to_vec())
}

/// Host name of the calling process
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
}

/// In-process communicator; every rank is a thread
pub struct LocalComm {
    rank: i32,
    size: i32,
    host: String,
    info: HintSet,
    shared: Arc<Exchange>,
    name_cache: Mutex<Option<Arc<NameArray>>>,
}

impl LocalComm {
    /// A group of `size` ranks on the local host
    pub fn world(size: usize) -> Vec<LocalComm> {
        let host = hostname();
        Self::on_hosts(&vec![host.as_str(); size])
    }

    /// One rank per entry of `hosts`, rank `i` placed on `hosts[i]`
    pub fn on_hosts(hosts: &[&str]) -> Vec<LocalComm> {
        let shared = Arc::new(Exchange {
            barrier: Barrier::new(hosts.len()),
            slots: Mutex::new(vec![Vec::new(); hosts.len()]),
        });
        hosts
            .iter()
            .enumerate()
            .map(|(rank, host)| LocalComm {
                rank: rank as i32,
                size: hosts.len() as i32,
                host: host.to_string(),
                info: HintSet::new(),
                shared: Arc::clone(&shared),
                name_cache: Mutex::new(None),
            })
            .collect()
    }

    /// Advertise `info` as this communicator's attributes
    pub fn with_info(mut self, info: HintSet) -> Self {
        self.info = info;
        self
    }

    fn exchange(&self, data: Vec<u8>) -> Vec<Vec<u8>> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[self.rank as usize] = data;
        self.shared.barrier.wait();
        let all = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Nobody may overwrite a slot until everyone has read this round
        self.shared.barrier.wait();
        all
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn processor_name(&self) -> String {
        self.host.clone()
    }

    fn info(&self) -> HintSet {
        self.info.clone()
    }

    fn allreduce_i32(&self, value: i32, op: ReduceOp) -> i32 {
        self.exchange(value.to_le_bytes().to_vec())
            .iter()
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .fold(value, |acc, v| op.apply(acc, v))
    }

    fn bcast(&self, root: i32, data: Vec<u8>) -> Vec<u8> {
        let data = if self.rank == root { data } else { Vec::new() };
        self.exchange(data)
            .into_iter()
            .nth(root as usize)
            .unwrap_or_default()
    }

    fn allgather(&self, data: Vec<u8>) -> Vec<Vec<u8>> {
        self.exchange(data)
    }

    fn cached_name_array(&self) -> Option<Arc<NameArray>> {
        self.name_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cache_name_array(&self, names: Arc<NameArray>) {
        *self
            .name_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(names);
    }
}
