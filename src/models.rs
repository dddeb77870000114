//! Built-in node models.
//!
//! - [`neurons`]: neurons, assigned to a single VP and reached through the spike exchange
//! - [`devices`]: stimulation and recording devices, replicated on every thread
pub mod devices;
pub mod neurons;
