use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::tempdir;

use rusty_kernel::core::config::KernelConfig;
use rusty_kernel::core::connection::{Connection, SynapseModel};
use rusty_kernel::core::context::{KernelState, SimulationContext};
use rusty_kernel::core::node::{Model, UpdateContext};
use rusty_kernel::core::recording::{FileSink, MemorySink};
use rusty_kernel::core::spike::{Emission, SpikeInput};
use rusty_kernel::core::time::Step;
use rusty_kernel::error::KernelError;
use rusty_kernel::models::devices::{PoissonGenerator, SpikeGenerator, SpikeRecorder};
use rusty_kernel::models::neurons::{ParrotNeuron, ThresholdNeuron};

/// Counts its updates.
#[derive(Debug, Clone)]
struct Counter {
    updates: Arc<AtomicUsize>,
}

impl Model for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn update(&mut self, _ctx: &mut UpdateContext<'_>, _inputs: &[SpikeInput]) -> Vec<Emission> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        vec![]
    }
}

fn local_kernel(num_threads: usize) -> SimulationContext {
    let config = KernelConfig::default().with_threads(num_threads).with_seed(5);
    SimulationContext::new_local(config).unwrap()
}

fn recorded(kernel: &SimulationContext, recorder: usize) -> Vec<(usize, Step)> {
    let mut events = kernel
        .events(recorder)
        .unwrap()
        .iter()
        .map(|event| (event.sender, event.step))
        .collect::<Vec<_>>();
    events.sort();
    events
}

/// Noise-driven threshold neurons with recurrent connections, all recorded.
fn noisy_network(kernel: &mut SimulationContext) -> usize {
    let noise = kernel
        .create(PoissonGenerator::build(800.0).unwrap(), 1)
        .unwrap()[0];
    let neuron = ThresholdNeuron::build(10.0, 1.0, 0.0)
        .unwrap()
        .with_refractory(0.5)
        .unwrap();
    let neurons = kernel.create(neuron, 6).unwrap();
    let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
    for (i, &neuron) in neurons.iter().enumerate() {
        let next = neurons[(i + 1) % neurons.len()];
        kernel
            .connect(Connection::new(neuron, next, 0.5, 0.1 * (i + 3) as f64))
            .unwrap();
        kernel.connect(Connection::new(noise, neuron, 0.5, 0.2)).unwrap();
        kernel.connect(Connection::new(neuron, recorder, 1.0, 0.2)).unwrap();
    }
    recorder
}

#[test]
fn test_lifecycle_states() {
    let mut kernel = local_kernel(2);
    assert_eq!(kernel.state(), KernelState::Idle);
    assert!(matches!(kernel.run(1.0), Err(KernelError::InvalidState(_))));
    assert!(matches!(kernel.cleanup(), Err(KernelError::InvalidState(_))));

    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    kernel.prepare().unwrap();
    assert_eq!(kernel.state(), KernelState::Prepared);

    assert!(matches!(
        kernel.create(ParrotNeuron::new(), 1),
        Err(KernelError::InvalidState(_))
    ));
    assert!(matches!(
        kernel.connect(Connection::new(parrots[0], parrots[1], 1.0, 0.1)),
        Err(KernelError::InvalidState(_))
    ));
    assert!(matches!(kernel.prepare(), Err(KernelError::InvalidState(_))));
    assert!(matches!(
        kernel.configure(KernelConfig::default()),
        Err(KernelError::InvalidState(_))
    ));

    kernel.run(1.0).unwrap();
    assert_eq!(kernel.state(), KernelState::Prepared);
    assert_eq!(kernel.current_step(), 10);
    kernel.cleanup().unwrap();
    assert_eq!(kernel.state(), KernelState::Idle);
    assert_eq!(kernel.kernel_status().network_size, 2);
}

#[test]
fn test_invalid_durations_and_delays() {
    let mut kernel = local_kernel(1);
    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    assert!(matches!(
        kernel.connect(Connection::new(parrots[0], parrots[1], 1.0, 0.15)),
        Err(KernelError::InvalidDelay(_))
    ));
    assert!(matches!(
        kernel.connect(Connection::new(parrots[0], parrots[1], 1.0, 0.0)),
        Err(KernelError::InvalidDelay(_))
    ));
    assert!(matches!(
        kernel.connect(Connection::new(parrots[0], 7, 1.0, 0.1)),
        Err(KernelError::UnknownNode(7))
    ));

    // Device times off the grid are not rounded
    assert!(matches!(
        kernel.create(SpikeGenerator::build(&[0.15]).unwrap(), 1),
        Err(KernelError::InvalidParameter(_))
    ));
    assert_eq!(kernel.kernel_status().network_size, 2);

    kernel.prepare().unwrap();
    assert!(matches!(kernel.run(0.25), Err(KernelError::InvalidParameter(_))));
    assert!(matches!(kernel.run(-1.0), Err(KernelError::InvalidParameter(_))));
    kernel.run(0.0).unwrap();
    assert_eq!(kernel.current_step(), 0);
    kernel.cleanup().unwrap();
}

#[test]
fn test_delay_envelope_is_sealed_by_prepare() {
    let mut kernel = local_kernel(2);
    let parrots = kernel.create(ParrotNeuron::new(), 3).unwrap();
    kernel
        .connect(Connection::new(parrots[0], parrots[1], 1.0, 1.0))
        .unwrap();
    kernel
        .connect(Connection::new(parrots[1], parrots[2], 1.0, 2.0))
        .unwrap();

    // Before sealing, any delay widens the envelope, and removing connections narrows it
    kernel
        .connect(Connection::new(parrots[2], parrots[0], 1.0, 0.5))
        .unwrap();
    assert!((kernel.kernel_status().min_delay - 0.5).abs() < 1e-12);
    assert_eq!(kernel.disconnect(parrots[2], parrots[0]).unwrap(), 1);
    assert!((kernel.kernel_status().min_delay - 1.0).abs() < 1e-12);

    kernel.simulate(5.0).unwrap();
    let status = kernel.kernel_status();
    assert!((status.min_delay - 1.0).abs() < 1e-12);
    assert!((status.max_delay - 2.0).abs() < 1e-12);

    assert!(matches!(
        kernel.connect(Connection::new(parrots[0], parrots[2], 1.0, 0.5)),
        Err(KernelError::DelayOutOfEnvelope { .. })
    ));
    assert!(matches!(
        kernel.connect(Connection::new(parrots[0], parrots[2], 1.0, 2.5)),
        Err(KernelError::DelayOutOfEnvelope { .. })
    ));
    kernel
        .connect(Connection::new(parrots[0], parrots[2], 1.0, 1.5))
        .unwrap();
    assert_eq!(kernel.kernel_status().num_connections, 3);

    assert!(matches!(
        kernel.disconnect(parrots[0], parrots[1]),
        Err(KernelError::InvalidState(_))
    ));
    assert!(matches!(
        kernel.set_delay_extrema(0.5, 3.0),
        Err(KernelError::InvalidState(_))
    ));
}

#[test]
fn test_manual_delay_extrema() {
    let mut kernel = local_kernel(1);
    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    assert!(kernel.set_delay_extrema(0.0, 1.0).is_err());
    assert!(kernel.set_delay_extrema(2.0, 1.0).is_err());
    kernel.set_delay_extrema(0.5, 3.0).unwrap();
    kernel
        .connect(Connection::new(parrots[0], parrots[1], 1.0, 1.0))
        .unwrap();

    kernel.simulate(1.0).unwrap();
    let status = kernel.kernel_status();
    assert!((status.min_delay - 0.5).abs() < 1e-12);
    assert!((status.max_delay - 3.0).abs() < 1e-12);
    kernel
        .connect(Connection::new(parrots[1], parrots[0], 1.0, 3.0))
        .unwrap();
}

#[test]
fn test_updates_are_batched_by_min_delay() {
    let updates = Arc::new(AtomicUsize::new(0));
    let mut kernel = local_kernel(1);
    kernel
        .create(
            Counter {
                updates: Arc::clone(&updates),
            },
            1,
        )
        .unwrap();
    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    kernel
        .connect(Connection::new(parrots[0], parrots[1], 1.0, 0.5))
        .unwrap();

    kernel.simulate(10.0).unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 100);
    assert_eq!(kernel.exchange_stats().rounds, 20);

    // Partial cycles are completed by the next run before any exchange
    kernel.prepare().unwrap();
    kernel.run(0.3).unwrap();
    assert_eq!(kernel.current_step(), 103);
    assert_eq!(kernel.exchange_stats().rounds, 20);
    kernel.run(0.7).unwrap();
    assert_eq!(kernel.current_step(), 110);
    assert_eq!(kernel.exchange_stats().rounds, 22);
    kernel.cleanup().unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 110);
}

#[test]
fn test_device_traffic_is_not_exchanged() {
    let mut kernel = local_kernel(2);
    let generator = kernel
        .create(SpikeGenerator::build(&[0.5, 1.0, 1.5]).unwrap(), 1)
        .unwrap()[0];
    let parrots = kernel.create(ParrotNeuron::new(), 4).unwrap();
    let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
    for &parrot in parrots.iter() {
        kernel
            .connect(Connection::new(generator, parrot, 1.0, 0.1))
            .unwrap();
        kernel
            .connect(Connection::new(parrot, recorder, 1.0, 0.1))
            .unwrap();
    }

    kernel.simulate(3.0).unwrap();
    assert_eq!(recorded(&kernel, recorder).len(), 12);
    let stats = kernel.exchange_stats();
    assert_eq!(stats.spikes_sent, 0);
    assert_eq!(stats.spikes_received, 0);
    assert_eq!(stats.rounds, 30);
}

#[test]
fn test_neuron_traffic_is_exchanged() {
    let mut kernel = local_kernel(2);
    let generator = kernel
        .create(SpikeGenerator::build(&[0.5, 1.0]).unwrap(), 1)
        .unwrap()[0];
    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
    kernel
        .connect(Connection::new(generator, parrots[0], 1.0, 0.1))
        .unwrap();
    kernel
        .connect(Connection::new(parrots[0], parrots[1], 1.0, 0.3))
        .unwrap();
    kernel
        .connect(Connection::new(parrots[1], recorder, 1.0, 0.1))
        .unwrap();

    kernel.simulate(3.0).unwrap();
    let stats = kernel.exchange_stats();
    assert_eq!(stats.spikes_sent, 2);
    assert_eq!(stats.spikes_received, 2);
    // Generator at steps 5 and 10, first parrot one step later, second parrot three more
    assert_eq!(recorded(&kernel, recorder), vec![(parrots[1], 9), (parrots[1], 14)]);
}

#[test]
fn test_pause_and_resume() {
    let mut whole = local_kernel(3);
    let recorder = noisy_network(&mut whole);
    whole.simulate(100.0).unwrap();
    let expected = recorded(&whole, recorder);
    assert!(!expected.is_empty());

    let mut split = local_kernel(3);
    noisy_network(&mut split);
    split.prepare().unwrap();
    split.run(50.0).unwrap();
    split.run(50.0).unwrap();
    split.cleanup().unwrap();
    assert_eq!(recorded(&split, recorder), expected);

    let mut twice = local_kernel(3);
    noisy_network(&mut twice);
    twice.simulate(33.3).unwrap();
    twice.simulate(66.7).unwrap();
    assert_eq!(twice.current_step(), 1000);
    assert_eq!(recorded(&twice, recorder), expected);
}

#[test]
fn test_same_seed_same_results() {
    let mut first = local_kernel(2);
    let recorder = noisy_network(&mut first);
    first.simulate(50.0).unwrap();

    let mut second = local_kernel(2);
    noisy_network(&mut second);
    second.simulate(50.0).unwrap();
    assert_eq!(recorded(&first, recorder), recorded(&second, recorder));

    let config = KernelConfig::default().with_threads(2).with_seed(6);
    let mut other = SimulationContext::new_local(config).unwrap();
    noisy_network(&mut other);
    other.simulate(50.0).unwrap();
    assert_ne!(recorded(&first, recorder), recorded(&other, recorder));
}

#[test]
fn test_connect_many() {
    let mut kernel = local_kernel(2);
    let parrots = kernel.create(ParrotNeuron::new(), 3).unwrap();
    let batch = [
        Connection::new(parrots[0], parrots[1], 1.0, 0.1),
        Connection::new(parrots[0], parrots[1], 2.0, 0.2),
        Connection::new(parrots[1], parrots[2], 1.0, 0.1),
    ];
    assert_eq!(kernel.connect_many(&batch, false).unwrap(), 2);
    assert_eq!(kernel.kernel_status().num_connections, 2);
    assert_eq!(kernel.connect_many(&batch, true).unwrap(), 3);
    assert_eq!(kernel.kernel_status().num_connections, 5);
    assert_eq!(kernel.num_local_connections(), 5);

    // A single invalid connection rejects the whole batch
    let invalid = [
        Connection::new(parrots[2], parrots[0], 1.0, 0.1),
        Connection::new(parrots[2], 42, 1.0, 0.1),
    ];
    assert!(matches!(
        kernel.connect_many(&invalid, true),
        Err(KernelError::UnknownNode(42))
    ));
    assert_eq!(kernel.kernel_status().num_connections, 5);

    assert_eq!(kernel.disconnect(parrots[0], parrots[1]).unwrap(), 3);
    assert_eq!(kernel.disconnect(parrots[0], parrots[1]).unwrap(), 0);
    assert_eq!(kernel.num_local_connections(), 2);
    assert_eq!(kernel.kernel_status().num_connections, 2);
}

#[test]
fn test_depressing_synapse_weakens_inputs() {
    let mut kernel = local_kernel(1);
    let generator = kernel
        .create(SpikeGenerator::build(&[1.0, 1.1, 1.2]).unwrap(), 1)
        .unwrap()[0];
    let neuron = ThresholdNeuron::build(1000.0, 100.0, 0.0).unwrap();
    let neurons = kernel.create(neuron, 2).unwrap();
    let depressing = SynapseModel::Depressing {
        u: 0.5,
        tau_rec: 800.0,
    };
    kernel
        .connect(Connection::new(generator, neurons[0], 1.0, 0.1).with_synapse(depressing))
        .unwrap();
    kernel
        .connect(Connection::new(generator, neurons[1], 1.0, 0.1))
        .unwrap();
    assert!(kernel
        .connect(
            Connection::new(generator, neurons[1], 1.0, 0.1).with_synapse(SynapseModel::Depressing {
                u: 1.5,
                tau_rec: 800.0
            })
        )
        .is_err());
    kernel.simulate(2.0).unwrap();
    assert_eq!(kernel.kernel_status().num_connections, 2);
}

#[test]
fn test_file_sink() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("spikes.dat");

    let mut kernel = local_kernel(2);
    let generator = kernel
        .create(SpikeGenerator::build(&[0.5, 1.5]).unwrap(), 1)
        .unwrap()[0];
    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
    for &parrot in parrots.iter() {
        kernel
            .connect(Connection::new(generator, parrot, 1.0, 0.1))
            .unwrap();
        kernel
            .connect(Connection::new(parrot, recorder, 1.0, 0.1))
            .unwrap();
    }
    let memory = MemorySink::new();
    kernel
        .attach_sink(recorder, Box::new(FileSink::new(&path)))
        .unwrap();
    kernel.attach_sink(recorder, Box::new(memory.clone())).unwrap();
    assert!(matches!(
        kernel.attach_sink(parrots[0], Box::new(MemorySink::new())),
        Err(KernelError::InvalidParameter(_))
    ));

    kernel.simulate(1.0).unwrap();
    let lines = fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 2);
    assert_eq!(memory.snapshot().len(), 2);

    // Reopening after cleanup appends to the same file
    kernel.simulate(1.0).unwrap();
    let lines = fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 4);
    assert!(lines.lines().all(|line| line.split('\t').count() == 2));
    assert_eq!(kernel.events(recorder).unwrap().len(), 4);
}

#[test]
fn test_sink_collisions_fail_before_running() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("spikes.dat");
    fs::write(&path, "keep\n").unwrap();

    let mut kernel = local_kernel(1);
    let recorders = kernel.create(SpikeRecorder::new(), 2).unwrap();
    kernel
        .attach_sink(recorders[0], Box::new(FileSink::new(&path)))
        .unwrap();

    // The file exists and overwriting is disabled
    assert!(matches!(kernel.prepare(), Err(KernelError::SinkCollision(_))));
    assert_eq!(kernel.state(), KernelState::Idle);
    assert_eq!(fs::read_to_string(&path).unwrap(), "keep\n");

    // Two sinks on the same file
    let other = dir.path().join("other.dat");
    let mut kernel = local_kernel(1);
    let recorders = kernel.create(SpikeRecorder::new(), 2).unwrap();
    kernel
        .attach_sink(recorders[0], Box::new(FileSink::new(&other)))
        .unwrap();
    kernel
        .attach_sink(recorders[1], Box::new(FileSink::new(&other)))
        .unwrap();
    assert!(matches!(kernel.prepare(), Err(KernelError::SinkCollision(_))));
    assert!(!other.exists());
    assert_eq!(kernel.state(), KernelState::Idle);

    // Overwriting allowed
    let config = KernelConfig::default().with_overwrite(true);
    let mut kernel = SimulationContext::new_local(config).unwrap();
    let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
    kernel
        .attach_sink(recorder, Box::new(FileSink::new(&path)))
        .unwrap();
    kernel.simulate(1.0).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "");
}

#[test]
fn test_failed_prepare_keeps_overwritten_files() {
    let dir = tempdir().unwrap();
    let existing = dir.path().join("a.dat");
    fs::write(&existing, "precious").unwrap();

    let config = KernelConfig::default().with_overwrite(true);
    let mut kernel = SimulationContext::new_local(config).unwrap();
    let recorders = kernel.create(SpikeRecorder::new(), 2).unwrap();
    kernel
        .attach_sink(recorders[0], Box::new(FileSink::new(&existing)))
        .unwrap();
    kernel
        .attach_sink(
            recorders[1],
            Box::new(FileSink::new(dir.path().join("missing_dir").join("b.dat"))),
        )
        .unwrap();

    assert!(matches!(kernel.prepare(), Err(KernelError::IOError(_))));
    assert_eq!(kernel.state(), KernelState::Idle);
    assert_eq!(fs::read_to_string(&existing).unwrap(), "precious");
}

#[test]
fn test_reset() {
    let mut kernel = local_kernel(2);
    let recorder = noisy_network(&mut kernel);
    kernel.simulate(10.0).unwrap();
    assert!(kernel.time() > 9.9);

    kernel.reset().unwrap();
    let status = kernel.kernel_status();
    assert_eq!(status.state, KernelState::Idle);
    assert_eq!(status.network_size, 0);
    assert_eq!(status.num_connections, 0);
    assert_eq!(status.time, 0.0);
    assert_eq!(kernel.num_local_nodes(), 0);
    assert!(matches!(kernel.events(recorder), Err(KernelError::UnknownNode(_))));

    // The envelope is open again
    let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
    kernel
        .connect(Connection::new(parrots[0], parrots[1], 1.0, 5.0))
        .unwrap();
    assert!((kernel.kernel_status().min_delay - 5.0).abs() < 1e-12);

    // Reconfiguration is possible on an empty kernel only
    assert!(kernel.configure(KernelConfig::default().with_threads(4)).is_err());
    kernel.reset().unwrap();
    kernel
        .configure(KernelConfig::default().with_threads(4))
        .unwrap();
    assert_eq!(kernel.kernel_status().local_num_threads, 4);
}

#[test]
fn test_config_round_trip_through_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kernel.json");
    let config = KernelConfig::default().with_threads(3).with_seed(11);
    config.save_to(&path).unwrap();
    let loaded = KernelConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);
    let kernel = SimulationContext::new_local(loaded).unwrap();
    assert_eq!(kernel.kernel_status().total_num_virtual_procs, 3);
}
