//! This crate provides a simulation kernel for spiking neural networks in Rust, mixing
//! time-driven node updates with event-driven spike delivery.
//!
//! # Virtual Processes
//!
//! The network is partitioned over virtual processes (VPs), each one thread of one process.
//! Neurons are dealt to VPs round-robin by id, devices are replicated on every thread.
//! Results only depend on the total number of VPs and the seed, not on how the VPs are
//! spread over processes and threads.
//!
//! # Simulating Networks
//!
//! Time advances in steps of `resolution`, grouped into cycles of `min_delay`. Within a
//! cycle threads update their nodes independently; at the end of the cycle spikes are
//! exchanged between processes and buffered until their due step.
//!
//! ```rust
//! use rusty_kernel::core::config::KernelConfig;
//! use rusty_kernel::core::connection::Connection;
//! use rusty_kernel::core::context::SimulationContext;
//! use rusty_kernel::models::devices::{PoissonGenerator, SpikeRecorder};
//! use rusty_kernel::models::neurons::ThresholdNeuron;
//!
//! let config = KernelConfig::default().with_resolution(0.1).with_threads(4).with_seed(7);
//! let mut kernel = SimulationContext::new_local(config).unwrap();
//!
//! let neurons = kernel.create(ThresholdNeuron::build(10.0, 1.0, 0.0).unwrap(), 10).unwrap();
//! let noise = kernel.create(PoissonGenerator::build(2000.0).unwrap(), 1).unwrap()[0];
//! let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
//!
//! for &neuron in neurons.iter() {
//!     kernel.connect(Connection::new(noise, neuron, 0.3, 0.1)).unwrap();
//!     kernel.connect(Connection::new(neuron, recorder, 1.0, 0.1)).unwrap();
//! }
//! kernel.connect(Connection::new(neurons[0], neurons[1], 0.5, 1.5)).unwrap();
//!
//! kernel.simulate(100.0).unwrap();
//!
//! assert_eq!(kernel.kernel_status().num_connections, 21);
//! assert!(!kernel.events(recorder).unwrap().is_empty());
//! ```
//!
//! # Distributed Simulations
//!
//! Processes exchange spikes through an [`core::exchange::ExchangeTransport`]. The
//! [`core::exchange::InProcessTransport`] runs several processes as threads of one program.
pub mod core;
pub mod error;
pub mod models;
