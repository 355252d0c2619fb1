//! Heun flow-matching scheduler (second-order predictor-corrector).
//!
//! Each logical step uses two model evaluations:
//! 1. **Predictor**: Euler step from `σ` to `σ_next`
//! 2. **Corrector**: re-evaluate at the predicted state (timestep `σ_next`),
//!    average the two velocities and redo the step from the stored sample
//!
//! The final step lands on `σ = 0` where a second evaluation is meaningless,
//! so it is a plain Euler step.

use candle_core::Tensor;

use super::{Scheduler, SchedulerConfig, mean_shift};
use crate::Result;

/// Heun flow-matching scheduler.
pub struct HeunScheduler {
    config: SchedulerConfig,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
    /// Stored state from predictor pass.
    prev_derivative: Option<Tensor>,
    prev_sample: Option<Tensor>,
}

impl HeunScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
            prev_derivative: None,
            prev_sample: None,
        }
    }

    fn is_last(&self, step_index: usize) -> bool {
        self.sigmas[step_index + 1].abs() < 1e-10
    }
}

impl Scheduler for HeunScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        self.sigmas = self.config.sigma_schedule(num_inference_steps);
        self.timesteps = self.sigmas[..num_inference_steps]
            .iter()
            .map(|sigma| sigma * 1000.0)
            .collect();
        self.prev_derivative = None;
        self.prev_sample = None;
    }

    fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn evaluations(&self, step_index: usize) -> usize {
        if self.is_last(step_index) { 1 } else { 2 }
    }

    fn eval_timestep(&self, step_index: usize, eval: usize) -> f64 {
        if eval == 0 {
            self.timesteps[step_index]
        } else {
            self.sigmas[step_index + 1] * 1000.0
        }
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];
        let omega = self.config.omega();
        let dt = sigma_next - sigma;

        // For a velocity model the derivative dx/dσ is the prediction itself.
        match (self.prev_derivative.take(), self.prev_sample.take()) {
            (Some(prev_deriv), Some(prev_sample)) => {
                // Corrector step: average derivatives, apply to stored sample.
                let avg_derivative = ((&prev_deriv + model_output)? * 0.5)?;
                let dx = mean_shift(&(avg_derivative * dt)?, omega)?;
                Ok((prev_sample + dx)?)
            }
            _ => {
                // Predictor step: store state (unless this is the last step), take Euler step.
                if !self.is_last(step_index) {
                    self.prev_derivative = Some(model_output.clone());
                    self.prev_sample = Some(sample.clone());
                }
                let dx = mean_shift(&(model_output * dt)?, omega)?;
                Ok((sample + dx)?)
            }
        }
    }
}
