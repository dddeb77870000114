//! Module implementing the node update interface.
//!
//! Neuron and device dynamics are pluggable: the kernel only sees the [`Model`] trait,
//! invoked once per elementary step for every local node.
use std::fmt;

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::recording::RecorderEvent;
use super::spike::{Emission, SpikeInput};
use super::time::{Step, TimeConverter};
use crate::error::KernelError;

/// The scheduling category of a node.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum NodeKind {
    /// Assigned to exactly one VP, reached through the spike exchange.
    Neuron,
    /// Replicated once per thread, reached by local delivery only.
    Device,
}

/// The dynamics of a node.
pub trait Model: Send + fmt::Debug {
    /// The name of the model, reported in node status.
    fn name(&self) -> &'static str;

    /// The scheduling category of the model.
    fn kind(&self) -> NodeKind {
        NodeKind::Neuron
    }

    /// Check the times held by the model against the resolution, before nodes are created.
    fn validate(&self, _converter: &TimeConverter) -> Result<(), KernelError> {
        Ok(())
    }

    /// Advance the node by one step, given the spikes due at that step.
    /// Returns the spikes emitted during the step.
    fn update(&mut self, ctx: &mut UpdateContext<'_>, inputs: &[SpikeInput]) -> Vec<Emission>;
}

/// What a node update can see and do besides its own state.
pub struct UpdateContext<'a> {
    node_id: usize,
    step: Step,
    resolution: f64,
    rng: &'a mut ChaCha8Rng,
    records: &'a mut Vec<(usize, RecorderEvent)>,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn new(
        node_id: usize,
        step: Step,
        resolution: f64,
        rng: &'a mut ChaCha8Rng,
        records: &'a mut Vec<(usize, RecorderEvent)>,
    ) -> Self {
        UpdateContext {
            node_id,
            step,
            resolution,
            rng,
            records,
        }
    }

    /// Returns the id of the node being updated.
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Returns the step being updated.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Returns the time at the step being updated, in ms.
    pub fn time(&self) -> f64 {
        self.step as f64 * self.resolution
    }

    /// Returns the resolution, in ms.
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Returns the random number generator of the VP.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        self.rng
    }

    /// Emit a recorder event on behalf of `sender`, stamped with the given step.
    pub fn record(&mut self, sender: usize, stamp: Step, payload: Vec<f64>) {
        let event = RecorderEvent::new(sender, stamp, self.resolution, payload);
        self.records.push((self.node_id, event));
    }
}

/// Scheduling status of a node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: usize,
    pub model: String,
    pub kind: NodeKind,
    /// Whether this process owns the node.
    pub local: bool,
    /// The VP owning the node, or hosting the reported replica of a device.
    pub vp: usize,
    /// The thread hosting that VP within its process.
    pub thread: usize,
}
