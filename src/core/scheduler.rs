//! Module implementing the per-VP update loop.
//!
//! A [`VirtualProcess`] owns everything one thread touches during a dmin cycle: its nodes,
//! the connections targeting them, its ring buffer, its random stream and its outbound
//! spikes. Threads never share state during the update phase.
use std::collections::HashMap;

use log::trace;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::connection::{Connection, ConnectionTable, Synapse};
use super::node::{Model, NodeKind, UpdateContext};
use super::recording::RecorderEvent;
use super::ring_buffer::RingBuffer;
use super::spike::{PendingDelivery, SpikeEvent};
use super::time::Step;
use super::vp::Vp;

/// A node instance hosted by a VP.
#[derive(Debug)]
pub(crate) struct LocalNode {
    pub id: usize,
    pub kind: NodeKind,
    pub model: Box<dyn Model>,
}

/// The state of one virtual process.
#[derive(Debug)]
pub(crate) struct VirtualProcess {
    vp: Vp,
    thread: usize,
    nodes: Vec<LocalNode>,
    index_of: HashMap<usize, usize>,
    /// Neuron to neuron synapses targeting local neurons.
    global: ConnectionTable,
    /// Synapses from or to a device, delivered without exchange.
    local: ConnectionTable,
    ring: RingBuffer<PendingDelivery>,
    outbound: Vec<SpikeEvent>,
    rng: ChaCha8Rng,
    records: Vec<(usize, RecorderEvent)>,
}

impl VirtualProcess {
    /// Create an empty VP whose random stream depends only on `seed` and `vp`.
    pub fn new(vp: Vp, thread: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(vp as u64);
        VirtualProcess {
            vp,
            thread,
            nodes: vec![],
            index_of: HashMap::new(),
            global: ConnectionTable::default(),
            local: ConnectionTable::default(),
            ring: RingBuffer::new(1, 0),
            outbound: vec![],
            rng,
            records: vec![],
        }
    }

    pub fn vp(&self) -> Vp {
        self.vp
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_synapses(&self) -> usize {
        self.global.len() + self.local.len()
    }

    /// Returns the number of deliveries waiting in the ring buffer.
    pub fn pending(&self) -> usize {
        self.ring.pending()
    }

    /// Returns the thread-local index of a node hosted by this VP.
    pub fn index_of(&self, node_id: usize) -> Option<usize> {
        self.index_of.get(&node_id).copied()
    }

    /// Host a new node. Nodes are updated in the order they are added.
    pub fn add_node(&mut self, id: usize, kind: NodeKind, model: Box<dyn Model>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(LocalNode { id, kind, model });
        self.index_of.insert(id, index);
        index
    }

    /// Store a neuron to neuron connection targeting a local neuron.
    pub fn add_global_synapse(&mut self, connection: &Connection, delay: Step) {
        if let Some(index) = self.index_of(connection.target_id) {
            self.global
                .add(connection.source_id, Synapse::new(index, delay, connection));
        }
    }

    /// Store a connection from or to a device, targeting a node instance of this VP.
    pub fn add_local_synapse(&mut self, connection: &Connection, delay: Step) {
        if let Some(index) = self.index_of(connection.target_id) {
            self.local
                .add(connection.source_id, Synapse::new(index, delay, connection));
        }
    }

    /// Remove all synapses from `source_id` to `target_id` held by this VP.
    pub fn remove_synapses(&mut self, source_id: usize, target_id: usize) -> usize {
        match self.index_of(target_id) {
            Some(index) => {
                self.global.remove_pair(source_id, index) + self.local.remove_pair(source_id, index)
            }
            None => 0,
        }
    }

    /// Resize the ring buffer; pending deliveries keep their due step.
    pub fn resize_ring(&mut self, len: usize) {
        self.ring.resize(len);
    }

    /// Update every node for the steps `from..to`.
    pub fn update(&mut self, from: Step, to: Step, resolution: f64) {
        for step in from..to {
            let mut due = self.ring.drain(step);
            // Stable: deliveries to the same node keep their arrival order.
            due.sort_by_key(|delivery| delivery.local_index);
            let inputs = due.iter().map(|delivery| delivery.input).collect::<Vec<_>>();

            let mut cursor = 0;
            for (index, node) in self.nodes.iter_mut().enumerate() {
                let start = cursor;
                while cursor < due.len() && due[cursor].local_index == index {
                    cursor += 1;
                }

                let mut ctx =
                    UpdateContext::new(node.id, step, resolution, &mut self.rng, &mut self.records);
                let emissions = node.model.update(&mut ctx, &inputs[start..cursor]);

                for emission in emissions {
                    let event = SpikeEvent::new(node.id, step, emission.multiplicity);
                    if let Some(synapses) = self.local.get_mut(node.id) {
                        for synapse in synapses.iter_mut() {
                            let input = synapse.transmit(&event, resolution);
                            self.ring.insert(
                                input.due,
                                PendingDelivery {
                                    local_index: synapse.target_index,
                                    input,
                                },
                            );
                        }
                    }
                    if node.kind == NodeKind::Neuron {
                        self.outbound.push(event);
                    }
                }
            }
        }
        trace!("VP {} updated steps {}..{}", self.vp, from, to);
    }

    /// Take the spikes emitted by local neurons since the last exchange.
    pub fn take_outbound(&mut self) -> Vec<SpikeEvent> {
        std::mem::take(&mut self.outbound)
    }

    /// Take the recorder events emitted since the last call, tagged with their device.
    pub fn take_records(&mut self) -> Vec<(usize, RecorderEvent)> {
        std::mem::take(&mut self.records)
    }

    /// Deliver spikes received from the exchange into the ring buffer.
    /// Spikes are handled in (emission step, source) order, whatever process sent them.
    pub fn deliver(&mut self, mut inbound: Vec<SpikeEvent>, resolution: f64) {
        inbound.sort();
        for event in inbound.iter() {
            if let Some(synapses) = self.global.get_mut(event.source_id) {
                for synapse in synapses.iter_mut() {
                    let input = synapse.transmit(event, resolution);
                    self.ring.insert(
                        input.due,
                        PendingDelivery {
                            local_index: synapse.target_index,
                            input,
                        },
                    );
                }
            }
        }
    }
}
