//! Module tracking the minimum and maximum connection delays of the network.
//!
//! Every connection tuple ingested by a process is folded into the tracker, whether or
//! not its target is local. Since every process ingests the same tuples, the extrema agree
//! across processes without a collective.
use std::collections::{BTreeMap, HashMap};

use log::debug;

use super::time::Step;
use crate::error::KernelError;

/// Running extrema of the connection delays, in steps.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DelayExtrema {
    /// Multiset of the delays of all existing connections.
    counts: BTreeMap<Step, usize>,
    /// Delays of all existing connections, by ordered (source, target) pair.
    pairs: HashMap<(usize, usize), Vec<Step>>,
    /// Administrative envelope set before the first run.
    manual: Option<(Step, Step)>,
    /// The frozen envelope, once time-stepped execution has begun.
    sealed: Option<(Step, Step)>,
}

impl DelayExtrema {
    pub fn new() -> Self {
        DelayExtrema::default()
    }

    /// Returns `true` once the envelope is frozen.
    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Returns `true` if a connection with the given delay may be created.
    pub fn admits(&self, delay: Step) -> bool {
        match self.sealed {
            Some((min, max)) => delay >= min && delay <= max,
            None => delay > 0,
        }
    }

    /// Fold the delay of a new connection into the extrema.
    ///
    /// # Panics
    /// If the delay is outside the sealed envelope; callers check [`DelayExtrema::admits`] first.
    pub fn observe(&mut self, source_id: usize, target_id: usize, delay: Step) {
        assert!(self.admits(delay), "delay {} steps is not admissible", delay);
        *self.counts.entry(delay).or_insert(0) += 1;
        self.pairs
            .entry((source_id, target_id))
            .or_default()
            .push(delay);
    }

    /// Returns `true` if at least one connection from `source_id` to `target_id` exists.
    pub fn contains_pair(&self, source_id: usize, target_id: usize) -> bool {
        self.pairs.contains_key(&(source_id, target_id))
    }

    /// Remove all connections from `source_id` to `target_id`, returning the number removed.
    /// The extrema are recomputed from the remaining connections.
    pub fn forget_pair(
        &mut self,
        source_id: usize,
        target_id: usize,
    ) -> Result<usize, KernelError> {
        if self.is_sealed() {
            return Err(KernelError::InvalidState(
                "connections cannot be removed once the delay envelope is sealed".to_string(),
            ));
        }
        let delays = self.pairs.remove(&(source_id, target_id)).unwrap_or_default();
        for delay in delays.iter() {
            if let Some(count) = self.counts.get_mut(delay) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(delay);
                }
            }
        }
        Ok(delays.len())
    }

    /// Set the envelope manually, widening the observed extrema.
    /// Only allowed before the envelope is sealed.
    pub fn set_manual(&mut self, min_delay: Step, max_delay: Step) -> Result<(), KernelError> {
        if self.is_sealed() {
            return Err(KernelError::InvalidState(
                "the delay envelope is sealed and can no longer be changed".to_string(),
            ));
        }
        if min_delay == 0 || min_delay > max_delay {
            return Err(KernelError::InvalidParameter(format!(
                "invalid delay envelope [{}, {}] steps",
                min_delay, max_delay
            )));
        }
        self.manual = Some((min_delay, max_delay));
        Ok(())
    }

    /// Returns the minimum delay in steps.
    pub fn min_delay(&self) -> Step {
        self.extrema().0
    }

    /// Returns the maximum delay in steps.
    pub fn max_delay(&self) -> Step {
        self.extrema().1
    }

    /// Returns the total number of connections observed, local or not.
    pub fn num_connections(&self) -> usize {
        self.counts.values().sum()
    }

    fn extrema(&self) -> (Step, Step) {
        if let Some(sealed) = self.sealed {
            return sealed;
        }
        let observed = match (self.counts.keys().next(), self.counts.keys().next_back()) {
            (Some(&min), Some(&max)) => Some((min, max)),
            _ => None,
        };
        match (observed, self.manual) {
            (Some((min, max)), Some((manual_min, manual_max))) => {
                (min.min(manual_min), max.max(manual_max))
            }
            (Some(extrema), None) => extrema,
            (None, Some(manual)) => manual,
            (None, None) => (1, 1),
        }
    }

    /// Freeze the envelope at its current value. Sealing twice is a no-op.
    pub fn seal(&mut self) -> (Step, Step) {
        if self.sealed.is_none() {
            let extrema = self.extrema();
            debug!("Sealing delay envelope at [{}, {}] steps", extrema.0, extrema.1);
            self.sealed = Some(extrema);
        }
        self.extrema()
    }
}
