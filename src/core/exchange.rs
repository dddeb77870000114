//! Module implementing the spike exchange collective between processes.
//!
//! At the end of every dmin cycle each process hands over the spikes of its local neurons,
//! sorted by destination VP, and receives the spikes destined to its own VPs. The exchange
//! is a barrier: no process returns before every process has contributed, or before one of
//! them has withdrawn after a failure.
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::warn;

use serde::{Deserialize, Serialize};

use super::spike::SpikeEvent;
use crate::error::KernelError;

/// The collective moving spikes between processes.
pub trait ExchangeTransport: Send + fmt::Debug {
    /// The rank of this process.
    fn rank(&self) -> usize;

    /// The number of processes taking part in the exchange.
    fn num_processes(&self) -> usize;

    /// Exchange spikes with all processes.
    ///
    /// `outbound` holds one list per VP of the whole simulation. The result holds, for each
    /// thread of this process, the spikes sent by all processes to the VP of that thread.
    fn exchange(
        &mut self,
        outbound: Vec<Vec<SpikeEvent>>,
    ) -> Result<Vec<Vec<SpikeEvent>>, KernelError>;

    /// Withdraw this process after a failure. Every pending and later `exchange` of the other
    /// processes returns an error instead of waiting for this one.
    fn abort(&self, _reason: &str) {}
}

/// Counters of the traffic carried by the exchange collective.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct ExchangeStats {
    /// The number of collective rounds.
    pub rounds: u64,
    /// The number of spike events handed to the collective by this process.
    pub spikes_sent: u64,
    /// The number of spike events received from the collective by this process.
    pub spikes_received: u64,
}

/// The exchange of a single process, where every VP is local.
#[derive(Debug, Default, Clone)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        LocalTransport
    }
}

impl ExchangeTransport for LocalTransport {
    fn rank(&self) -> usize {
        0
    }

    fn num_processes(&self) -> usize {
        1
    }

    fn exchange(
        &mut self,
        outbound: Vec<Vec<SpikeEvent>>,
    ) -> Result<Vec<Vec<SpikeEvent>>, KernelError> {
        Ok(outbound)
    }
}

/// A reusable barrier which any member can break, releasing everyone waiting on it.
#[derive(Debug)]
struct Rendezvous {
    size: usize,
    state: Mutex<RendezvousState>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
    broken: Option<String>,
}

impl Rendezvous {
    fn new(size: usize) -> Self {
        Rendezvous {
            size,
            state: Mutex::new(RendezvousState::default()),
            cvar: Condvar::new(),
        }
    }

    /// Block until all members have arrived, or until the rendezvous is broken.
    fn wait(&self) -> Result<(), KernelError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(reason) = &state.broken {
            return Err(KernelError::ExchangeError(reason.clone()));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation && state.broken.is_none() {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        // A round completed before the break still counts
        match &state.broken {
            Some(reason) if state.generation == generation => {
                Err(KernelError::ExchangeError(reason.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Release all current and future waiters with an error. The first reason is kept.
    fn break_with(&self, reason: String) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.broken.is_none() {
            state.broken = Some(reason);
        }
        self.cvar.notify_all();
    }
}

#[derive(Debug)]
struct Mailboxes {
    rendezvous: Rendezvous,
    outbound: Mutex<Vec<Vec<Vec<SpikeEvent>>>>,
}

/// An exchange between several processes emulated by threads of one OS process.
///
/// Every member of a group must be driven by its own thread, since [`ExchangeTransport::exchange`]
/// blocks until all members have called it. Dropping a member withdraws it from the group.
#[derive(Debug)]
pub struct InProcessTransport {
    rank: usize,
    num_processes: usize,
    mailboxes: Arc<Mailboxes>,
}

impl InProcessTransport {
    /// Create the transports of a group of `num_processes` processes, indexed by rank.
    pub fn group(num_processes: usize) -> Result<Vec<Self>, KernelError> {
        if num_processes == 0 {
            return Err(KernelError::InvalidParameter(
                "an exchange group needs at least one process".to_string(),
            ));
        }
        let mailboxes = Arc::new(Mailboxes {
            rendezvous: Rendezvous::new(num_processes),
            outbound: Mutex::new(vec![vec![]; num_processes]),
        });
        Ok((0..num_processes)
            .map(|rank| InProcessTransport {
                rank,
                num_processes,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect())
    }

    fn lock_mailboxes(&self) -> Result<MutexGuard<'_, Vec<Vec<Vec<SpikeEvent>>>>, KernelError> {
        self.mailboxes
            .outbound
            .lock()
            .map_err(|_| {
                let reason = format!("process {} found a poisoned mailbox", self.rank);
                self.abort(&reason);
                KernelError::ExchangeError(reason)
            })
    }
}

impl ExchangeTransport for InProcessTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_processes(&self) -> usize {
        self.num_processes
    }

    fn exchange(
        &mut self,
        outbound: Vec<Vec<SpikeEvent>>,
    ) -> Result<Vec<Vec<SpikeEvent>>, KernelError> {
        self.lock_mailboxes()?[self.rank] = outbound;
        self.mailboxes.rendezvous.wait()?;

        let inbound = {
            let mailboxes = self.lock_mailboxes()?;
            let total_vps = mailboxes[self.rank].len();
            if mailboxes.iter().any(|mailbox| mailbox.len() != total_vps)
                || total_vps % self.num_processes != 0
            {
                Err(KernelError::ExchangeError(format!(
                    "processes disagree on the number of VPs: {:?}",
                    mailboxes.iter().map(|mailbox| mailbox.len()).collect::<Vec<_>>()
                )))
            } else {
                let num_threads = total_vps / self.num_processes;
                Ok((0..num_threads)
                    .map(|thread| {
                        let vp = thread * self.num_processes + self.rank;
                        mailboxes
                            .iter()
                            .flat_map(|mailbox| mailbox[vp].iter().copied())
                            .collect::<Vec<SpikeEvent>>()
                    })
                    .collect::<Vec<_>>())
            }
        };

        // No process may overwrite its mailbox before everyone has read.
        self.mailboxes.rendezvous.wait()?;
        inbound
    }

    fn abort(&self, reason: &str) {
        warn!("Process {} withdraws from the exchange: {}", self.rank, reason);
        self.mailboxes
            .rendezvous
            .break_with(format!("process {} failed: {}", self.rank, reason));
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        self.mailboxes
            .rendezvous
            .break_with(format!("process {} left the exchange", self.rank));
    }
}
