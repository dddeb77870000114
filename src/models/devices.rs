//! Stimulation and recording devices.
//!
//! Devices are replicated on every thread. A generator replica only drives the neurons of
//! its own thread, and a recorder replica only sees the spikes of those neurons.
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::core::node::{Model, NodeKind, UpdateContext};
use crate::core::spike::{Emission, SpikeInput};
use crate::core::time::{Step, TimeConverter};
use crate::error::KernelError;

fn on_grid(converter: &TimeConverter, what: &str, time: f64) -> Result<(), KernelError> {
    match converter.try_steps(time) {
        Some(_) => Ok(()),
        None => Err(KernelError::InvalidParameter(format!(
            "{} {} ms is not a multiple of the resolution {} ms",
            what,
            time,
            converter.resolution()
        ))),
    }
}

/// The period during which a device is active, in ms: `[start, stop)`.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct ActivityWindow {
    pub start: f64,
    pub stop: Option<f64>,
}

impl Default for ActivityWindow {
    fn default() -> Self {
        ActivityWindow {
            start: 0.0,
            stop: None,
        }
    }
}

impl ActivityWindow {
    pub fn build(start: f64, stop: Option<f64>) -> Result<Self, KernelError> {
        if !(start.is_finite() && start >= 0.0) {
            return Err(KernelError::InvalidParameter(format!(
                "device start must be non-negative, got {}",
                start
            )));
        }
        if let Some(stop) = stop {
            if !(stop.is_finite() && stop >= start) {
                return Err(KernelError::InvalidParameter(format!(
                    "device stop {} must not precede start {}",
                    stop, start
                )));
            }
        }
        Ok(ActivityWindow { start, stop })
    }

    /// Fails unless both bounds lie on the simulation grid.
    pub fn validate(&self, converter: &TimeConverter) -> Result<(), KernelError> {
        on_grid(converter, "device start", self.start)?;
        match self.stop {
            Some(stop) => on_grid(converter, "device stop", stop),
            None => Ok(()),
        }
    }

    /// Returns `true` if the device is active at step `step`. Bounds are on the grid.
    pub fn is_active(&self, step: Step, resolution: f64) -> bool {
        let start = (self.start / resolution).round() as Step;
        let stop = self.stop.map(|stop| (stop / resolution).round() as Step);
        step >= start && stop.map_or(true, |stop| step < stop)
    }
}

/// Emits spikes following a Poisson process, drawn from the random stream of its VP.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PoissonGenerator {
    rate: f64,
    window: ActivityWindow,
}

impl PoissonGenerator {
    /// Create a generator with the given rate, in Hz.
    pub fn build(rate: f64) -> Result<Self, KernelError> {
        if !(rate.is_finite() && rate >= 0.0) {
            return Err(KernelError::InvalidParameter(format!(
                "rate must be non-negative, got {}",
                rate
            )));
        }
        Ok(PoissonGenerator {
            rate,
            window: ActivityWindow::default(),
        })
    }

    pub fn with_window(mut self, window: ActivityWindow) -> Self {
        self.window = window;
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Model for PoissonGenerator {
    fn name(&self) -> &'static str {
        "poisson_generator"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Device
    }

    fn validate(&self, converter: &TimeConverter) -> Result<(), KernelError> {
        self.window.validate(converter)
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>, _inputs: &[SpikeInput]) -> Vec<Emission> {
        if !self.window.is_active(ctx.step(), ctx.resolution()) {
            return vec![];
        }
        let mean = self.rate * ctx.resolution() / 1000.0;
        match Poisson::new(mean) {
            Ok(poisson) => {
                let count: f64 = poisson.sample(ctx.rng());
                if count >= 1.0 {
                    vec![Emission::with_multiplicity(count as u32)]
                } else {
                    vec![]
                }
            }
            // Zero rate
            Err(_) => vec![],
        }
    }
}

/// Emits spikes at prescribed times, which must be multiples of the resolution.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SpikeGenerator {
    spike_times: Vec<f64>,
    next: usize,
}

impl SpikeGenerator {
    /// Create a generator emitting at the given times, in ms. Times are sorted.
    pub fn build(spike_times: &[f64]) -> Result<Self, KernelError> {
        if spike_times.iter().any(|t| !(t.is_finite() && *t >= 0.0)) {
            return Err(KernelError::InvalidParameter(
                "spike times must be finite and non-negative".to_string(),
            ));
        }
        let mut spike_times = spike_times.to_vec();
        spike_times.sort_by(|t1, t2| t1.total_cmp(t2));
        Ok(SpikeGenerator {
            spike_times,
            next: 0,
        })
    }

    pub fn spike_times(&self) -> &[f64] {
        &self.spike_times
    }
}

impl Model for SpikeGenerator {
    fn name(&self) -> &'static str {
        "spike_generator"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Device
    }

    fn validate(&self, converter: &TimeConverter) -> Result<(), KernelError> {
        self.spike_times
            .iter()
            .try_for_each(|&time| on_grid(converter, "spike time", time))
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>, _inputs: &[SpikeInput]) -> Vec<Emission> {
        let mut multiplicity = 0;
        while let Some(&time) = self.spike_times.get(self.next) {
            let step = (time / ctx.resolution()).round() as Step;
            if step > ctx.step() {
                break;
            }
            if step == ctx.step() {
                multiplicity += 1;
            }
            self.next += 1;
        }
        if multiplicity > 0 {
            vec![Emission::with_multiplicity(multiplicity)]
        } else {
            vec![]
        }
    }
}

/// Records every spike it receives: one event per spike, with the sender and emission time.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct SpikeRecorder {
    window: ActivityWindow,
}

impl SpikeRecorder {
    pub fn new() -> Self {
        SpikeRecorder::default()
    }

    pub fn with_window(mut self, window: ActivityWindow) -> Self {
        self.window = window;
        self
    }
}

impl Model for SpikeRecorder {
    fn name(&self) -> &'static str {
        "spike_recorder"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Device
    }

    fn validate(&self, converter: &TimeConverter) -> Result<(), KernelError> {
        self.window.validate(converter)
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>, inputs: &[SpikeInput]) -> Vec<Emission> {
        for input in inputs {
            if self.window.is_active(input.stamp, ctx.resolution()) {
                for _ in 0..input.multiplicity {
                    ctx.record(input.source_id, input.stamp, vec![]);
                }
            }
        }
        vec![]
    }
}
