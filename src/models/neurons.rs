//! Neuron models.
use serde::{Deserialize, Serialize};

use crate::core::node::{Model, UpdateContext};
use crate::core::spike::{Emission, SpikeInput};
use crate::core::time::TimeConverter;
use crate::error::KernelError;

/// Repeats every spike it receives, at the step the spike arrives.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct ParrotNeuron;

impl ParrotNeuron {
    pub fn new() -> Self {
        ParrotNeuron
    }
}

impl Model for ParrotNeuron {
    fn name(&self) -> &'static str {
        "parrot_neuron"
    }

    fn update(&mut self, _ctx: &mut UpdateContext<'_>, inputs: &[SpikeInput]) -> Vec<Emission> {
        let multiplicity = inputs.iter().map(|input| input.multiplicity).sum::<u32>();
        if multiplicity > 0 {
            vec![Emission::with_multiplicity(multiplicity)]
        } else {
            vec![]
        }
    }
}

/// A leaky integrate-and-fire neuron on the simulation grid.
///
/// At every step the potential decays towards zero with time constant `tau_m`, then the
/// weighted inputs and the constant drive `bias` are added. Crossing `threshold` emits a
/// spike, resets the potential and silences the neuron for `refractory` ms.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ThresholdNeuron {
    tau_m: f64,
    threshold: f64,
    reset: f64,
    refractory: f64,
    bias: f64,
    potential: f64,
    refractory_steps_left: u64,
}

impl ThresholdNeuron {
    /// Create a neuron with the given membrane time constant (ms), threshold and reset.
    pub fn build(tau_m: f64, threshold: f64, reset: f64) -> Result<Self, KernelError> {
        if !(tau_m.is_finite() && tau_m > 0.0) {
            return Err(KernelError::InvalidParameter(format!(
                "membrane time constant must be positive, got {}",
                tau_m
            )));
        }
        if !(threshold.is_finite() && reset.is_finite()) || reset >= threshold {
            return Err(KernelError::InvalidParameter(format!(
                "reset {} must be finite and below the threshold {}",
                reset, threshold
            )));
        }
        Ok(ThresholdNeuron {
            tau_m,
            threshold,
            reset,
            refractory: 0.0,
            bias: 0.0,
            potential: reset,
            refractory_steps_left: 0,
        })
    }

    /// Set the refractory period, in ms.
    pub fn with_refractory(mut self, refractory: f64) -> Result<Self, KernelError> {
        if !(refractory.is_finite() && refractory >= 0.0) {
            return Err(KernelError::InvalidParameter(format!(
                "refractory period must be non-negative, got {}",
                refractory
            )));
        }
        self.refractory = refractory;
        Ok(self)
    }

    /// Set the constant drive added at every step.
    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }

    /// Returns the membrane potential.
    pub fn potential(&self) -> f64 {
        self.potential
    }
}

impl Model for ThresholdNeuron {
    fn name(&self) -> &'static str {
        "threshold_neuron"
    }

    fn validate(&self, converter: &TimeConverter) -> Result<(), KernelError> {
        match converter.try_steps(self.refractory) {
            Some(_) => Ok(()),
            None => Err(KernelError::InvalidParameter(format!(
                "refractory period {} ms is not a multiple of the resolution {} ms",
                self.refractory,
                converter.resolution()
            ))),
        }
    }

    fn update(&mut self, ctx: &mut UpdateContext<'_>, inputs: &[SpikeInput]) -> Vec<Emission> {
        if self.refractory_steps_left > 0 {
            self.refractory_steps_left -= 1;
            return vec![];
        }

        let drive = inputs
            .iter()
            .map(|input| input.weight * input.multiplicity as f64)
            .sum::<f64>();
        let decay = (-ctx.resolution() / self.tau_m).exp();
        self.potential = self.potential * decay + drive + self.bias;

        if self.potential >= self.threshold {
            self.potential = self.reset;
            self.refractory_steps_left = (self.refractory / ctx.resolution()).round() as u64;
            vec![Emission::single()]
        } else {
            vec![]
        }
    }
}
