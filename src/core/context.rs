//! Module implementing the simulation kernel of one process.
//!
//! A [`SimulationContext`] owns the network of its process, split into one
//! [`VirtualProcess`] per local thread, and drives the Idle -> Prepared -> Idle lifecycle.
//! Every process of a distributed simulation runs the same sequence of calls (create,
//! connect, prepare, run, cleanup); each process only instantiates what it owns.
use std::collections::{BTreeMap, HashMap, HashSet};

use derivative::Derivative;
use log::{debug, info, trace, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use super::config::KernelConfig;
use super::connection::{Connection, DeliveryPath};
use super::delay::DelayExtrema;
use super::exchange::{ExchangeStats, ExchangeTransport, LocalTransport};
use super::node::{Model, NodeKind, NodeStatus};
use super::recording::{RecorderEvent, RecordingManager, RecordingSink};
use super::scheduler::VirtualProcess;
use super::spike::SpikeEvent;
use super::time::{Step, TimeConverter};
use super::vp::{Vp, VirtualProcessMap};
use crate::error::KernelError;

/// The lifecycle state of a kernel.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum KernelState {
    /// No run in progress; the network may change.
    Idle,
    /// Envelope sealed, buffers allocated, sinks open.
    Prepared,
    /// Advancing time.
    Running,
}

/// Kernel-level status.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct KernelStatus {
    pub resolution: f64,
    /// The current simulation time, in ms.
    pub time: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    /// The number of connections of the whole network.
    pub num_connections: usize,
    /// The number of nodes of the whole network.
    pub network_size: usize,
    pub num_processes: usize,
    pub local_num_threads: usize,
    pub total_num_virtual_procs: usize,
    pub state: KernelState,
}

/// What every process knows about a node, local or not.
#[derive(Debug, Clone)]
struct NodeRecord {
    model: &'static str,
    kind: NodeKind,
}

/// The simulation kernel of one process.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SimulationContext {
    config: KernelConfig,
    converter: TimeConverter,
    map: VirtualProcessMap,
    transport: Box<dyn ExchangeTransport>,
    #[derivative(Debug = "ignore")]
    pool: Option<ThreadPool>,
    state: KernelState,
    /// The VPs of this process, indexed by thread.
    vps: Vec<VirtualProcess>,
    /// All nodes of the network, node `id` at index `id - 1`.
    nodes: Vec<NodeRecord>,
    delays: DelayExtrema,
    /// For every local neuron, the number of global connections towards each VP.
    remote_targets: HashMap<usize, BTreeMap<Vp, usize>>,
    recording: RecordingManager,
    stats: ExchangeStats,
    /// The first step of the current dmin cycle.
    slice_origin: Step,
    /// The number of steps of the current dmin cycle already updated.
    lag: Step,
}

impl SimulationContext {
    /// Create the kernel of one process, exchanging spikes through `transport`.
    pub fn new(
        config: KernelConfig,
        transport: Box<dyn ExchangeTransport>,
    ) -> Result<Self, KernelError> {
        let (converter, map) = config.validate(transport.num_processes())?;
        if transport.rank() >= transport.num_processes() {
            return Err(KernelError::ConfigError(format!(
                "rank {} is out of range for {} processes",
                transport.rank(),
                transport.num_processes()
            )));
        }
        let vps = build_vps(&map, transport.rank(), config.rng_seed);
        debug!(
            "Kernel on rank {} of {} with {} threads ({} VPs)",
            transport.rank(),
            map.num_processes(),
            map.num_threads(),
            map.total_vps()
        );
        Ok(SimulationContext {
            config,
            converter,
            map,
            transport,
            pool: None,
            state: KernelState::Idle,
            vps,
            nodes: vec![],
            delays: DelayExtrema::new(),
            remote_targets: HashMap::new(),
            recording: RecordingManager::new(),
            stats: ExchangeStats::default(),
            slice_origin: 0,
            lag: 0,
        })
    }

    /// Create the kernel of a single-process simulation.
    pub fn new_local(config: KernelConfig) -> Result<Self, KernelError> {
        SimulationContext::new(config, Box::new(LocalTransport::new()))
    }

    /// Replace the configuration. Only allowed on an empty, never-run kernel.
    pub fn configure(&mut self, config: KernelConfig) -> Result<(), KernelError> {
        self.ensure_idle("configure the kernel")?;
        if !self.nodes.is_empty() || self.delays.is_sealed() {
            return Err(KernelError::InvalidState(
                "the kernel can only be configured before any node is created".to_string(),
            ));
        }
        let (converter, map) = config.validate(self.transport.num_processes())?;
        self.vps = build_vps(&map, self.transport.rank(), config.rng_seed);
        self.converter = converter;
        self.map = map;
        self.config = config;
        self.pool = None;
        Ok(())
    }

    /// Returns the configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Returns the rank of this process.
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// Returns the VP map.
    pub fn vp_map(&self) -> &VirtualProcessMap {
        &self.map
    }

    /// Returns the current simulation time, in ms.
    pub fn time(&self) -> f64 {
        self.converter.time(self.current_step())
    }

    /// Returns the current simulation step.
    pub fn current_step(&self) -> Step {
        self.slice_origin + self.lag
    }

    /// Returns the number of node instances hosted by this process, device replicas included.
    pub fn num_local_nodes(&self) -> usize {
        self.vps.iter().map(|vp| vp.num_nodes()).sum()
    }

    /// Returns the traffic counters of the spike exchange.
    pub fn exchange_stats(&self) -> ExchangeStats {
        self.stats
    }

    fn ensure_idle(&self, operation: &str) -> Result<(), KernelError> {
        match self.state {
            KernelState::Idle => Ok(()),
            state => Err(KernelError::InvalidState(format!(
                "cannot {} while the kernel is {:?}; call cleanup() first",
                operation, state
            ))),
        }
    }

    fn record(&self, node_id: usize) -> Result<&NodeRecord, KernelError> {
        node_id
            .checked_sub(1)
            .and_then(|index| self.nodes.get(index))
            .ok_or(KernelError::UnknownNode(node_id))
    }

    /// Create `n` nodes of the model of `prototype`. Returns their ids, which are contiguous.
    ///
    /// A neuron is instantiated only by the process owning its VP; a device is instantiated
    /// once per local thread.
    pub fn create<M: Model + Clone + 'static>(
        &mut self,
        prototype: M,
        n: usize,
    ) -> Result<Vec<usize>, KernelError> {
        self.ensure_idle("create nodes")?;
        prototype.validate(&self.converter)?;
        let kind = prototype.kind();
        let name = prototype.name();
        let rank = self.rank();

        let first = self.nodes.len() + 1;
        for id in first..first + n {
            self.nodes.push(NodeRecord { model: name, kind });
            match kind {
                NodeKind::Neuron => {
                    let vp = self.map.assign(id);
                    if self.map.is_local_vp(vp, rank) {
                        let (_, thread) = self.map.resolve(vp);
                        self.vps[thread].add_node(id, kind, Box::new(prototype.clone()));
                    }
                }
                NodeKind::Device => {
                    for vp in self.vps.iter_mut() {
                        vp.add_node(id, kind, Box::new(prototype.clone()));
                    }
                }
            }
        }
        debug!("Created {} {} nodes ({:?})", n, name, kind);
        Ok((first..first + n).collect())
    }

    /// Classify a connection and convert its delay, without changing anything.
    fn check_connection(
        &self,
        connection: &Connection,
    ) -> Result<(DeliveryPath, Step), KernelError> {
        connection.validate()?;
        let source = self.record(connection.source_id)?;
        let target = self.record(connection.target_id)?;
        let delay = self.converter.delay_steps(connection.delay)?;
        if !self.delays.admits(delay) {
            return Err(KernelError::DelayOutOfEnvelope {
                delay: connection.delay,
                min_delay: self.converter.time(self.delays.min_delay()),
                max_delay: self.converter.time(self.delays.max_delay()),
            });
        }
        let path = match (source.kind, target.kind) {
            (NodeKind::Neuron, NodeKind::Neuron) => DeliveryPath::Global,
            _ => DeliveryPath::Local,
        };
        Ok((path, delay))
    }

    /// Store a checked connection on the VPs concerned.
    fn insert_connection(&mut self, connection: &Connection, path: DeliveryPath, delay: Step) {
        let rank = self.rank();
        self.delays
            .observe(connection.source_id, connection.target_id, delay);

        match path {
            DeliveryPath::Global => {
                let target_vp = self.map.assign(connection.target_id);
                if self.map.is_local_vp(target_vp, rank) {
                    let (_, thread) = self.map.resolve(target_vp);
                    self.vps[thread].add_global_synapse(connection, delay);
                }
                let source_vp = self.map.assign(connection.source_id);
                if self.map.is_local_vp(source_vp, rank) {
                    *self
                        .remote_targets
                        .entry(connection.source_id)
                        .or_default()
                        .entry(target_vp)
                        .or_insert(0) += 1;
                }
            }
            DeliveryPath::Local => {
                // Stored on the thread where source and target instances meet: the thread of
                // the neuron endpoint, or every thread between two devices.
                for thread in self.local_threads(connection) {
                    self.vps[thread].add_local_synapse(connection, delay);
                }
            }
        }
    }

    /// The local threads hosting both endpoints of a connection involving a device.
    fn local_threads(&self, connection: &Connection) -> Vec<usize> {
        let neuron = [connection.source_id, connection.target_id]
            .into_iter()
            .find(|&id| matches!(self.record(id), Ok(record) if record.kind == NodeKind::Neuron));
        match neuron {
            Some(id) => {
                let vp = self.map.assign(id);
                if self.map.is_local_vp(vp, self.rank()) {
                    vec![self.map.resolve(vp).1]
                } else {
                    vec![]
                }
            }
            None => (0..self.vps.len()).collect(),
        }
    }

    /// Create a connection.
    ///
    /// Before the first preparation any positive multiple of the resolution is accepted;
    /// afterwards the delay must lie within the sealed envelope.
    pub fn connect(&mut self, connection: Connection) -> Result<(), KernelError> {
        self.ensure_idle("connect")?;
        let (path, delay) = self.check_connection(&connection)?;
        self.insert_connection(&connection, path, delay);
        Ok(())
    }

    /// Create a batch of connections. Either all are created or none.
    ///
    /// Without multapses, a connection is skipped if the same ordered pair was already
    /// connected earlier in this batch; pairs connected by earlier calls are not considered.
    /// Returns the number of connections created.
    pub fn connect_many(
        &mut self,
        connections: &[Connection],
        allow_multapses: bool,
    ) -> Result<usize, KernelError> {
        self.ensure_idle("connect")?;
        let mut seen = HashSet::new();
        let mut checked = vec![];
        for connection in connections {
            let (path, delay) = self.check_connection(connection)?;
            if allow_multapses || seen.insert((connection.source_id, connection.target_id)) {
                checked.push((connection, path, delay));
            }
        }
        for (connection, path, delay) in checked.iter() {
            self.insert_connection(connection, *path, *delay);
        }
        trace!("Created {} of {} connections", checked.len(), connections.len());
        Ok(checked.len())
    }

    /// Remove all connections from `source_id` to `target_id`.
    /// Only allowed before the delay envelope is sealed. Returns the number removed.
    pub fn disconnect(&mut self, source_id: usize, target_id: usize) -> Result<usize, KernelError> {
        self.ensure_idle("disconnect")?;
        let source_kind = self.record(source_id)?.kind;
        let target_kind = self.record(target_id)?.kind;
        let removed = self.delays.forget_pair(source_id, target_id)?;
        if removed == 0 {
            return Ok(0);
        }

        for vp in self.vps.iter_mut() {
            vp.remove_synapses(source_id, target_id);
        }
        if source_kind == NodeKind::Neuron && target_kind == NodeKind::Neuron {
            let target_vp = self.map.assign(target_id);
            if let Some(targets) = self.remote_targets.get_mut(&source_id) {
                if let Some(count) = targets.get_mut(&target_vp) {
                    *count = count.saturating_sub(removed);
                    if *count == 0 {
                        targets.remove(&target_vp);
                    }
                }
                if targets.is_empty() {
                    self.remote_targets.remove(&source_id);
                }
            }
        }
        Ok(removed)
    }

    /// Widen the delay envelope manually, in ms. Only allowed before the first preparation.
    pub fn set_delay_extrema(&mut self, min_delay: f64, max_delay: f64) -> Result<(), KernelError> {
        self.ensure_idle("set the delay extrema")?;
        let min_delay = self.converter.delay_steps(min_delay)?;
        let max_delay = self.converter.delay_steps(max_delay)?;
        self.delays.set_manual(min_delay, max_delay)
    }

    /// Attach a recording sink to a device.
    pub fn attach_sink(
        &mut self,
        device_id: usize,
        sink: Box<dyn RecordingSink>,
    ) -> Result<(), KernelError> {
        self.ensure_idle("attach a sink")?;
        if self.record(device_id)?.kind != NodeKind::Device {
            return Err(KernelError::InvalidParameter(format!(
                "node {} is not a device",
                device_id
            )));
        }
        self.recording.attach(device_id, sink);
        Ok(())
    }

    /// Seal the delay envelope, size the buffers, and open the recording sinks.
    /// Fails before any of this takes effect if a sink cannot be opened, and withdraws the
    /// process from the exchange so that its peers fail too.
    pub fn prepare(&mut self) -> Result<(), KernelError> {
        self.ensure_idle("prepare")?;
        self.recording
            .open_all(self.config.overwrite_files)
            .map_err(|e| self.withdraw(e))?;

        let (min_delay, max_delay) = self.delays.seal();
        let len = (min_delay + max_delay) as usize;
        for vp in self.vps.iter_mut() {
            vp.resize_ring(len);
        }

        if self.pool.is_none() {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.map.num_threads())
                .build()
                .map_err(|e| KernelError::ConfigError(format!("cannot start threads: {}", e)));
            match pool {
                Ok(pool) => self.pool = Some(pool),
                Err(e) => {
                    if let Err(close_error) = self.recording.close_all() {
                        warn!("Could not close sinks: {}", close_error);
                    }
                    return Err(self.withdraw(e));
                }
            }
        }

        self.state = KernelState::Prepared;
        info!(
            "Prepared rank {}: {} local nodes, delays [{}, {}] steps, resolution {} ms",
            self.rank(),
            self.num_local_nodes(),
            min_delay,
            max_delay,
            self.converter.resolution()
        );
        Ok(())
    }

    /// Advance the simulation by `duration` ms. May be called repeatedly after `prepare`.
    /// Recording sinks are flushed at the end of the call.
    pub fn run(&mut self, duration: f64) -> Result<(), KernelError> {
        if self.state != KernelState::Prepared {
            return Err(KernelError::InvalidState(format!(
                "cannot run while the kernel is {:?}; call prepare() first",
                self.state
            )));
        }
        let steps = self.converter.duration_steps(duration)?;
        debug!(
            "Running {} steps from step {} on rank {}",
            steps,
            self.current_step(),
            self.rank()
        );

        self.state = KernelState::Running;
        let result = self.advance(steps);
        self.state = KernelState::Prepared;
        result.map_err(|e| self.withdraw(e))?;
        self.recording.flush_all()
    }

    /// Close the recording sinks and release the thread pool.
    /// Pending spikes stay buffered, so a later run continues seamlessly.
    pub fn cleanup(&mut self) -> Result<(), KernelError> {
        if self.state == KernelState::Idle {
            return Err(KernelError::InvalidState(
                "cannot clean up a kernel which is not prepared".to_string(),
            ));
        }
        self.state = KernelState::Idle;
        self.pool = None;
        debug!(
            "Cleaned up rank {} at step {}, {} deliveries pending",
            self.rank(),
            self.current_step(),
            self.vps.iter().map(|vp| vp.pending()).sum::<usize>()
        );
        self.recording.close_all()
    }

    /// `prepare`, `run` and `cleanup` in one call.
    pub fn simulate(&mut self, duration: f64) -> Result<(), KernelError> {
        self.prepare()?;
        let result = self.run(duration);
        let cleanup = self.cleanup();
        result.and(cleanup)
    }

    /// Drop the network, the recordings and the sealed envelope.
    /// Configuration and transport are kept.
    pub fn reset(&mut self) -> Result<(), KernelError> {
        let closed = match self.state {
            KernelState::Idle => Ok(()),
            _ => self.recording.close_all(),
        };
        self.vps = build_vps(&self.map, self.rank(), self.config.rng_seed);
        self.nodes.clear();
        self.delays = DelayExtrema::new();
        self.remote_targets.clear();
        self.recording = RecordingManager::new();
        self.stats = ExchangeStats::default();
        self.slice_origin = 0;
        self.lag = 0;
        self.pool = None;
        self.state = KernelState::Idle;
        debug!("Reset rank {}", self.rank());
        closed
    }

    /// Leave the exchange group after `error`, so that peers stop waiting for this process.
    fn withdraw(&self, error: KernelError) -> KernelError {
        self.transport.abort(&error.to_string());
        error
    }

    /// Update the network for `steps` steps, exchanging spikes at every dmin boundary.
    fn advance(&mut self, steps: Step) -> Result<(), KernelError> {
        let min_delay = self.delays.min_delay();
        let mut remaining = steps;
        while remaining > 0 {
            let from = self.lag;
            let to = min_delay.min(from + remaining);
            self.update_vps(self.slice_origin + from, self.slice_origin + to)?;
            self.collect_records();
            remaining -= to - from;
            self.lag = to;

            if to == min_delay {
                self.exchange_spikes()?;
                self.slice_origin += min_delay;
                self.lag = 0;
            }
        }
        Ok(())
    }

    fn update_vps(&mut self, from: Step, to: Step) -> Result<(), KernelError> {
        let resolution = self.converter.resolution();
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| KernelError::InvalidState("no thread pool".to_string()))?;
        let vps = &mut self.vps;
        pool.install(|| {
            vps.par_iter_mut()
                .for_each(|vp| vp.update(from, to, resolution))
        });
        Ok(())
    }

    /// Hand the recorder events of all threads to the sinks, in thread order.
    fn collect_records(&mut self) {
        for vp in self.vps.iter_mut() {
            for (device_id, event) in vp.take_records() {
                self.recording.push(device_id, &event);
            }
        }
    }

    /// Send the spikes of local neurons to the VPs hosting their targets, then deliver the
    /// spikes received into the ring buffers of local threads.
    fn exchange_spikes(&mut self) -> Result<(), KernelError> {
        let mut outbound: Vec<Vec<SpikeEvent>> = vec![vec![]; self.map.total_vps()];
        let mut sent = 0;
        for vp in self.vps.iter_mut() {
            for event in vp.take_outbound() {
                if let Some(targets) = self.remote_targets.get(&event.source_id) {
                    for &target_vp in targets.keys() {
                        outbound[target_vp].push(event);
                        sent += 1;
                    }
                }
            }
        }

        let inbound = self.transport.exchange(outbound)?;
        if inbound.len() != self.vps.len() {
            return Err(KernelError::ExchangeError(format!(
                "received spikes for {} threads, expected {}",
                inbound.len(),
                self.vps.len()
            )));
        }
        let received = inbound.iter().map(|spikes| spikes.len() as u64).sum::<u64>();
        self.stats.rounds += 1;
        self.stats.spikes_sent += sent;
        self.stats.spikes_received += received;
        trace!(
            "Exchange round {} on rank {}: sent {}, received {}",
            self.stats.rounds,
            self.rank(),
            sent,
            received
        );

        let resolution = self.converter.resolution();
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| KernelError::InvalidState("no thread pool".to_string()))?;
        let vps = &mut self.vps;
        pool.install(|| {
            vps.par_iter_mut()
                .zip(inbound.into_par_iter())
                .for_each(|(vp, spikes)| vp.deliver(spikes, resolution))
        });
        Ok(())
    }

    /// Returns the scheduling status of a node.
    /// For a device, the replica of local thread 0 is reported.
    pub fn node_status(&self, node_id: usize) -> Result<NodeStatus, KernelError> {
        let record = self.record(node_id)?;
        let (local, vp, thread) = match record.kind {
            NodeKind::Neuron => {
                let vp = self.map.assign(node_id);
                let (rank, thread) = self.map.resolve(vp);
                (rank == self.rank(), vp, thread)
            }
            NodeKind::Device => {
                let replica = &self.vps[0];
                (true, replica.vp(), replica.thread())
            }
        };
        Ok(NodeStatus {
            node_id,
            model: record.model.to_string(),
            kind: record.kind,
            local,
            vp,
            thread,
        })
    }

    /// Returns the kernel status.
    pub fn kernel_status(&self) -> KernelStatus {
        KernelStatus {
            resolution: self.converter.resolution(),
            time: self.time(),
            min_delay: self.converter.time(self.delays.min_delay()),
            max_delay: self.converter.time(self.delays.max_delay()),
            num_connections: self.delays.num_connections(),
            network_size: self.nodes.len(),
            num_processes: self.map.num_processes(),
            local_num_threads: self.map.num_threads(),
            total_num_virtual_procs: self.map.total_vps(),
            state: self.state,
        }
    }

    /// Returns the number of connections stored by this process.
    pub fn num_local_connections(&self) -> usize {
        self.vps.iter().map(|vp| vp.num_synapses()).sum()
    }

    /// Returns the events recorded by a device on this process, as held by its memory sinks.
    pub fn events(&self, device_id: usize) -> Result<Vec<RecorderEvent>, KernelError> {
        if self.record(device_id)?.kind != NodeKind::Device {
            return Err(KernelError::InvalidParameter(format!(
                "node {} is not a device",
                device_id
            )));
        }
        Ok(self.recording.events(device_id))
    }
}

fn build_vps(map: &VirtualProcessMap, rank: usize, seed: u64) -> Vec<VirtualProcess> {
    (0..map.num_threads())
        .map(|thread| VirtualProcess::new(map.vp_of(rank, thread), thread, seed))
        .collect()
}
