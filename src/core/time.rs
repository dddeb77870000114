//! Conversion between model time (ms) and simulation steps.
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// An elementary simulation step. All scheduling arithmetic is done in steps.
pub type Step = u64;

/// The relative tolerance used to decide whether a time is a multiple of the resolution.
pub const STEP_TOLERANCE: f64 = 1e-9;

/// Converts times in ms to steps for a fixed resolution.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct TimeConverter {
    resolution: f64,
}

impl TimeConverter {
    /// Create a converter for the given resolution (in ms).
    /// Returns an error if the resolution is not positive and finite.
    pub fn build(resolution: f64) -> Result<Self, KernelError> {
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(KernelError::InvalidParameter(format!(
                "resolution must be positive and finite, got {}",
                resolution
            )));
        }
        Ok(TimeConverter { resolution })
    }

    /// Returns the resolution in ms.
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Returns the number of steps in `time` ms, if `time` is a non-negative multiple of
    /// the resolution.
    pub fn try_steps(&self, time: f64) -> Option<Step> {
        if !time.is_finite() || time < 0.0 {
            return None;
        }
        let ratio = time / self.resolution;
        let steps = ratio.round();
        if (ratio - steps).abs() > STEP_TOLERANCE * ratio.max(1.0) {
            return None;
        }
        Some(steps as Step)
    }

    /// Converts a connection delay to steps.
    /// The delay must be a positive multiple of the resolution.
    pub fn delay_steps(&self, delay: f64) -> Result<Step, KernelError> {
        match self.try_steps(delay) {
            Some(steps) if steps > 0 => Ok(steps),
            _ => Err(KernelError::InvalidDelay(format!(
                "{} ms is not a positive multiple of the resolution {} ms",
                delay, self.resolution
            ))),
        }
    }

    /// Converts a simulation duration to steps.
    /// The duration must be a non-negative multiple of the resolution.
    pub fn duration_steps(&self, duration: f64) -> Result<Step, KernelError> {
        self.try_steps(duration).ok_or_else(|| {
            KernelError::InvalidParameter(format!(
                "duration {} ms is not a non-negative multiple of the resolution {} ms",
                duration, self.resolution
            ))
        })
    }

    /// Returns the time in ms at the given step.
    pub fn time(&self, step: Step) -> f64 {
        step as f64 * self.resolution
    }
}
