//! Module implementing the spike events moved by the scheduler.
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::time::Step;

/// A spike emitted by a node, as carried by the spike exchange.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct SpikeEvent {
    /// The id of the node emitting the spike.
    pub source_id: usize,
    /// The step at which the spike is emitted.
    pub stamp: Step,
    /// The number of spikes emitted at once.
    pub multiplicity: u32,
}

impl SpikeEvent {
    pub fn new(source_id: usize, stamp: Step, multiplicity: u32) -> Self {
        SpikeEvent {
            source_id,
            stamp,
            multiplicity,
        }
    }
}

impl PartialOrd for SpikeEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Spikes are ordered by emission step, then by source id.
/// This order does not depend on which process or thread produced the spike.
impl Ord for SpikeEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.stamp, self.source_id, self.multiplicity).cmp(&(
            other.stamp,
            other.source_id,
            other.multiplicity,
        ))
    }
}

/// A spike as received by a node at its due step.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct SpikeInput {
    /// The id of the node which emitted the spike.
    pub source_id: usize,
    /// The step at which the spike was emitted.
    pub stamp: Step,
    /// The step at which the spike is delivered.
    pub due: Step,
    /// The efficacy of the connection at delivery time.
    pub weight: f64,
    /// The receptor port of the target.
    pub receptor: usize,
    /// The number of spikes received at once.
    pub multiplicity: u32,
}

/// A spike emission requested by a node update.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Emission {
    pub multiplicity: u32,
}

impl Emission {
    /// A single spike.
    pub fn single() -> Self {
        Emission { multiplicity: 1 }
    }

    /// Several spikes emitted at the same step.
    pub fn with_multiplicity(multiplicity: u32) -> Self {
        Emission { multiplicity }
    }
}

/// A delivery pending in a ring buffer, addressed to a node by its thread-local index.
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) struct PendingDelivery {
    pub local_index: usize,
    pub input: SpikeInput,
}
