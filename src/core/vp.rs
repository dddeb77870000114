//! Module implementing the assignment of nodes to virtual processes.
//!
//! A virtual process (VP) is one thread within one process. Neurons are dealt to VPs
//! round-robin by id, VPs are dealt to processes round-robin by VP id.
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Identifier of a virtual process.
pub type Vp = usize;

/// Maps nodes to virtual processes and virtual processes to (rank, thread) pairs.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct VirtualProcessMap {
    num_processes: usize,
    num_threads: usize,
}

impl VirtualProcessMap {
    /// Create a map for the given number of processes and threads per process.
    pub fn build(num_processes: usize, num_threads: usize) -> Result<Self, KernelError> {
        if num_processes == 0 || num_threads == 0 {
            return Err(KernelError::InvalidParameter(format!(
                "number of processes and threads must be positive, got {} x {}",
                num_processes, num_threads
            )));
        }
        Ok(VirtualProcessMap {
            num_processes,
            num_threads,
        })
    }

    /// Returns the total number of virtual processes.
    pub fn total_vps(&self) -> usize {
        self.num_processes * self.num_threads
    }

    /// Returns the number of processes.
    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    /// Returns the number of threads per process.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Returns the VP owning the node with the given id.
    pub fn assign(&self, node_id: usize) -> Vp {
        assign(node_id, self.total_vps())
    }

    /// Returns the (rank, thread) pair hosting the given VP.
    ///
    /// # Panics
    /// If `vp` is not a valid VP id.
    pub fn resolve(&self, vp: Vp) -> (usize, usize) {
        assert!(
            vp < self.total_vps(),
            "VP {} is out of range (total VPs: {})",
            vp,
            self.total_vps()
        );
        (vp % self.num_processes, vp / self.num_processes)
    }

    /// Returns the VP hosted by the given (rank, thread) pair.
    pub fn vp_of(&self, rank: usize, thread: usize) -> Vp {
        assert!(rank < self.num_processes && thread < self.num_threads);
        thread * self.num_processes + rank
    }

    /// Returns `true` if the VP is hosted by the given rank.
    pub fn is_local_vp(&self, vp: Vp, rank: usize) -> bool {
        vp % self.num_processes == rank
    }
}

/// The VP of a node, a pure function of its id and the total number of VPs.
pub fn assign(node_id: usize, total_vps: usize) -> Vp {
    node_id % total_vps
}
