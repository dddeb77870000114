use std::path::PathBuf;
use std::thread;

use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rusty_kernel::core::config::KernelConfig;
use rusty_kernel::core::connection::Connection;
use rusty_kernel::core::context::SimulationContext;
use rusty_kernel::core::exchange::{ExchangeTransport, InProcessTransport};
use rusty_kernel::core::recording::FileSink;
use rusty_kernel::error::KernelError;
use rusty_kernel::models::devices::{PoissonGenerator, SpikeRecorder};
use rusty_kernel::models::neurons::ThresholdNeuron;

#[derive(Parser, Debug, Clone)]
struct Args {
    /// The number of neurons
    #[arg(short = 'N', long, default_value = "1000")]
    num_neurons: usize,
    /// The number of inputs per neuron
    #[arg(short = 'K', long, default_value = "100")]
    num_inputs: usize,
    /// The weight of recurrent connections
    #[arg(long, default_value = "0.05")]
    weight: f64,
    /// The minimum delay (ms)
    #[arg(long, default_value = "1.0")]
    min_delay: f64,
    /// The maximum delay (ms)
    #[arg(long, default_value = "5.0")]
    max_delay: f64,
    /// The rate of the external Poisson drive (Hz)
    #[arg(long, default_value = "8000.0")]
    rate: f64,
    /// The weight of the external drive
    #[arg(long, default_value = "0.1")]
    drive_weight: f64,
    /// The simulation duration (ms)
    #[arg(short = 'T', long, default_value = "1000.0")]
    duration: f64,
    /// The simulation resolution (ms)
    #[arg(long, default_value = "0.1")]
    resolution: f64,
    /// The number of processes, emulated by threads of this program
    #[arg(short = 'P', long, default_value = "1")]
    processes: usize,
    /// The number of threads per process
    #[arg(short = 't', long, default_value = "1")]
    threads: usize,
    /// The seed used for network sampling and simulation
    #[arg(long, default_value = "42")]
    seed: u64,
    /// The directory receiving one spike file per process
    #[arg(short = 'o', long, default_value = "spikes")]
    output: PathBuf,
    /// Replace existing spike files
    #[arg(long)]
    overwrite: bool,
    /// A file receiving the log, instead of the terminal
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<(), KernelError> {
    let encoder = Box::new(PatternEncoder::new("{d(%H:%M:%S%.3f)} {l} [{T}] - {m}\n"));
    let appender = match &args.log_file {
        Some(path) => {
            let file = FileAppender::builder()
                .encoder(encoder)
                .build(path)
                .map_err(|e| KernelError::IOError(e.to_string()))?;
            Appender::builder().build("main", Box::new(file))
        }
        None => {
            let console = ConsoleAppender::builder().encoder(encoder).build();
            Appender::builder().build("main", Box::new(console))
        }
    };
    let config = Config::builder()
        .appender(appender)
        .build(Root::builder().appender("main").build(LevelFilter::Info))
        .map_err(|e| KernelError::ConfigError(e.to_string()))?;
    log4rs::init_config(config).map_err(|e| KernelError::ConfigError(e.to_string()))?;
    Ok(())
}

/// Sample a network with fixed in-degree. Every process samples the same connections.
fn sample_connections(args: &Args, neurons: &[usize]) -> Result<Vec<Connection>, KernelError> {
    if args.max_delay < args.min_delay {
        return Err(KernelError::InvalidParameter(format!(
            "max delay {} is below min delay {}",
            args.max_delay, args.min_delay
        )));
    }
    if neurons.is_empty() {
        return Ok(vec![]);
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let source_dist = Uniform::new(0, neurons.len());
    let num_delays = ((args.max_delay - args.min_delay) / args.resolution).round() as usize;
    let delay_dist = Uniform::new_inclusive(0, num_delays);

    let mut connections = Vec::with_capacity(neurons.len() * args.num_inputs);
    for &target in neurons.iter() {
        for _ in 0..args.num_inputs {
            let source = neurons[source_dist.sample(&mut rng)];
            let delay = args.min_delay + delay_dist.sample(&mut rng) as f64 * args.resolution;
            connections.push(Connection::new(source, target, args.weight, delay));
        }
    }
    Ok(connections)
}

/// Build and simulate the network on one process.
fn run_process(args: &Args, transport: Box<dyn ExchangeTransport>) -> Result<usize, KernelError> {
    let config = KernelConfig::default()
        .with_resolution(args.resolution)
        .with_threads(args.threads)
        .with_seed(args.seed)
        .with_overwrite(args.overwrite);
    let rank = transport.rank();
    let mut kernel = SimulationContext::new(config, transport)?;

    let neuron = ThresholdNeuron::build(20.0, 1.0, 0.0)?.with_refractory(2.0)?;
    let neurons = kernel.create(neuron, args.num_neurons)?;
    let drive = kernel.create(PoissonGenerator::build(args.rate)?, 1)?[0];
    let recorder = kernel.create(SpikeRecorder::new(), 1)?[0];

    let connections = sample_connections(args, &neurons)?;
    kernel.connect_many(&connections, true)?;
    for &neuron in neurons.iter() {
        kernel.connect(Connection::new(drive, neuron, args.drive_weight, args.min_delay))?;
        kernel.connect(Connection::new(neuron, recorder, 1.0, args.min_delay))?;
    }

    let path = args.output.join(format!("spikes-{}.dat", rank));
    kernel.attach_sink(recorder, Box::new(FileSink::new(&path)))?;

    kernel.simulate(args.duration)?;

    let status = kernel.kernel_status();
    let stats = kernel.exchange_stats();
    log::info!(
        "Rank {}: {} ms simulated, delays [{}, {}] ms, {} exchange rounds, {} spikes sent",
        rank,
        status.time,
        status.min_delay,
        status.max_delay,
        stats.rounds,
        stats.spikes_sent
    );
    Ok(kernel.num_local_connections())
}

fn main() -> Result<(), KernelError> {
    let args = Args::parse();
    init_logging(&args)?;
    log::info!("{:?}", args);

    std::fs::create_dir_all(&args.output)?;

    let handles = InProcessTransport::group(args.processes)?
        .into_iter()
        .map(|transport| {
            let args = args.clone();
            thread::spawn(move || run_process(&args, Box::new(transport)))
        })
        .collect::<Vec<_>>();

    // A failing process withdraws from the exchange, so every other process returns too
    let mut num_connections = 0;
    let mut failure = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let outcome = handle
            .join()
            .map_err(|_| KernelError::InvalidState(format!("process {} panicked", rank)))
            .and_then(|outcome| outcome);
        match outcome {
            Ok(n) => num_connections += n,
            Err(e) => {
                log::error!("Process {} failed: {}", rank, e);
                failure.get_or_insert(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    log::info!(
        "Simulation done: {} connections stored, spikes written to {}",
        num_connections,
        args.output.display()
    );
    Ok(())
}
