//! Module implementing connections and their per-VP storage.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::spike::{SpikeEvent, SpikeInput};
use super::time::Step;
use crate::error::KernelError;

/// The dynamics of a synapse, applied at delivery time on the VP of the target.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize, Default)]
pub enum SynapseModel {
    /// Constant efficacy.
    #[default]
    Static,
    /// Short-term depression: each spike uses a fraction `u` of the available resources,
    /// which recover with time constant `tau_rec` (ms).
    Depressing { u: f64, tau_rec: f64 },
}

impl SynapseModel {
    fn validate(&self) -> Result<(), KernelError> {
        match *self {
            SynapseModel::Static => Ok(()),
            SynapseModel::Depressing { u, tau_rec } => {
                if !(u > 0.0 && u <= 1.0) {
                    return Err(KernelError::InvalidParameter(format!(
                        "utilization u must lie in (0, 1], got {}",
                        u
                    )));
                }
                if !(tau_rec.is_finite() && tau_rec > 0.0) {
                    return Err(KernelError::InvalidParameter(format!(
                        "recovery time constant must be positive, got {}",
                        tau_rec
                    )));
                }
                Ok(())
            }
        }
    }
}

/// A directed connection, as supplied by connection building.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// The ID of the node producing spikes.
    pub source_id: usize,
    /// The ID of the node receiving spikes.
    pub target_id: usize,
    /// The weight of the synapse.
    pub weight: f64,
    /// The delay of the synapse, in ms.
    pub delay: f64,
    /// The receptor port of the target.
    #[serde(default)]
    pub receptor: usize,
    #[serde(default)]
    pub synapse: SynapseModel,
}

impl Connection {
    /// Create a static connection on receptor 0.
    pub fn new(source_id: usize, target_id: usize, weight: f64, delay: f64) -> Self {
        Connection {
            source_id,
            target_id,
            weight,
            delay,
            receptor: 0,
            synapse: SynapseModel::Static,
        }
    }

    pub fn with_receptor(mut self, receptor: usize) -> Self {
        self.receptor = receptor;
        self
    }

    pub fn with_synapse(mut self, synapse: SynapseModel) -> Self {
        self.synapse = synapse;
        self
    }

    /// Check the parameters which do not depend on the kernel.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !self.weight.is_finite() {
            return Err(KernelError::InvalidParameter(format!(
                "connection weight must be finite, got {}",
                self.weight
            )));
        }
        self.synapse.validate()
    }
}

/// How spikes travel along a connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum DeliveryPath {
    /// Neuron to neuron, through the spike exchange collective.
    Global,
    /// Device to neuron or neuron to device, within a single thread.
    Local,
}

/// The dynamic state of a synapse.
#[derive(Debug, PartialEq, Clone, Copy)]
enum SynapseState {
    Static,
    Depressing {
        u: f64,
        tau_rec: f64,
        resources: f64,
        last_stamp: Option<Step>,
    },
}

/// A connection as stored on the VP of its target.
#[derive(Debug, PartialEq, Clone)]
pub(crate) struct Synapse {
    pub target_index: usize,
    pub delay: Step,
    pub weight: f64,
    pub receptor: usize,
    state: SynapseState,
}

impl Synapse {
    pub fn new(target_index: usize, delay: Step, connection: &Connection) -> Self {
        let state = match connection.synapse {
            SynapseModel::Static => SynapseState::Static,
            SynapseModel::Depressing { u, tau_rec } => SynapseState::Depressing {
                u,
                tau_rec,
                resources: 1.0,
                last_stamp: None,
            },
        };
        Synapse {
            target_index,
            delay,
            weight: connection.weight,
            receptor: connection.receptor,
            state,
        }
    }

    /// Transmit a spike along the synapse, updating its state.
    pub fn transmit(&mut self, event: &SpikeEvent, resolution: f64) -> SpikeInput {
        let weight = match &mut self.state {
            SynapseState::Static => self.weight,
            SynapseState::Depressing {
                u,
                tau_rec,
                resources,
                last_stamp,
            } => {
                let elapsed = last_stamp
                    .map(|last| (event.stamp.saturating_sub(last)) as f64 * resolution)
                    .unwrap_or(f64::INFINITY);
                let (efficacy, remaining) = depress(*resources, *u, *tau_rec, elapsed);
                *resources = remaining;
                *last_stamp = Some(event.stamp);
                self.weight * efficacy
            }
        };
        SpikeInput {
            source_id: event.source_id,
            stamp: event.stamp,
            due: event.stamp + self.delay,
            weight,
            receptor: self.receptor,
            multiplicity: event.multiplicity,
        }
    }
}

/// Recover the resources over `elapsed` ms, then use a fraction `u` of them.
/// Returns the used fraction and the remaining resources.
fn depress(resources: f64, u: f64, tau_rec: f64, elapsed: f64) -> (f64, f64) {
    let recovered = 1.0 - (1.0 - resources) * (-elapsed / tau_rec).exp();
    let used = u * recovered;
    (used, recovered - used)
}

/// The connections stored on one VP, indexed by source id.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ConnectionTable {
    by_source: HashMap<usize, Vec<Synapse>>,
    num_synapses: usize,
}

impl ConnectionTable {
    pub fn add(&mut self, source_id: usize, synapse: Synapse) {
        self.by_source.entry(source_id).or_default().push(synapse);
        self.num_synapses += 1;
    }

    /// Remove all synapses from `source_id` to the node with the given local index.
    pub fn remove_pair(&mut self, source_id: usize, target_index: usize) -> usize {
        let mut removed = 0;
        if let Some(synapses) = self.by_source.get_mut(&source_id) {
            let before = synapses.len();
            synapses.retain(|synapse| synapse.target_index != target_index);
            removed = before - synapses.len();
            if synapses.is_empty() {
                self.by_source.remove(&source_id);
            }
        }
        self.num_synapses -= removed;
        removed
    }

    pub fn get_mut(&mut self, source_id: usize) -> Option<&mut Vec<Synapse>> {
        self.by_source.get_mut(&source_id)
    }

    pub fn len(&self) -> usize {
        self.num_synapses
    }
}
