//! Core module defining the simulation kernel.
//!
//! It consists of the following components:
//!
//! - [`vp`]: Assigns nodes to virtual processes and virtual processes to (rank, thread)
//! - [`delay`]: Tracks the minimum and maximum connection delays and seals them
//! - [`ring_buffer`]: Holds pending spike deliveries of a thread, keyed by due step
//! - [`scheduler`]: Updates the nodes of a virtual process within a dmin cycle
//! - [`exchange`]: Moves spikes between processes at dmin boundaries
//! - [`recording`]: Hands recorder events to memory, file or terminal sinks
//! - [`context`]: Drives the prepare/run/cleanup lifecycle of a process
//!
//! # Examples
//!
//! ```
//! use rusty_kernel::core::config::KernelConfig;
//! use rusty_kernel::core::connection::Connection;
//! use rusty_kernel::core::context::SimulationContext;
//! use rusty_kernel::models::devices::{SpikeGenerator, SpikeRecorder};
//! use rusty_kernel::models::neurons::ParrotNeuron;
//!
//! let mut kernel = SimulationContext::new_local(KernelConfig::default().with_threads(2)).unwrap();
//! let parrots = kernel.create(ParrotNeuron::new(), 2).unwrap();
//! let generator = kernel.create(SpikeGenerator::build(&[1.0]).unwrap(), 1).unwrap()[0];
//! let recorder = kernel.create(SpikeRecorder::new(), 1).unwrap()[0];
//!
//! kernel.connect(Connection::new(generator, parrots[0], 1.0, 0.1)).unwrap();
//! kernel.connect(Connection::new(parrots[0], parrots[1], 1.0, 2.0)).unwrap();
//! for &parrot in parrots.iter() {
//!     kernel.connect(Connection::new(parrot, recorder, 1.0, 0.1)).unwrap();
//! }
//!
//! kernel.simulate(10.0).unwrap();
//!
//! let events = kernel.events(recorder).unwrap();
//! let mut spikes = events.iter().map(|e| (e.sender, e.step)).collect::<Vec<_>>();
//! spikes.sort();
//! assert_eq!(spikes, vec![(1, 11), (2, 31)]);
//! ```
pub mod config;
pub mod connection;
pub mod context;
pub mod delay;
pub mod exchange;
pub mod node;
pub mod recording;
pub mod ring_buffer;
pub mod scheduler;
pub mod spike;
pub mod time;
pub mod vp;
