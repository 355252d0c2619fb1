//! Euler flow-matching scheduler.
//!
//! First-order ODE integrator with omega mean-shifting.
//!
//! Update rule:
//! ```text
//! dx = (σ_next - σ) * v
//! m  = mean(dx)
//! dx' = (dx - m) * ω + m     // ω ≈ 1.046 at omega_scale = 10
//! x_next = x + dx'
//! ```

use candle_core::Tensor;

use super::{Scheduler, SchedulerConfig, mean_shift};
use crate::Result;

/// Euler flow-matching scheduler.
pub struct EulerScheduler {
    config: SchedulerConfig,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
}

impl EulerScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
        }
    }
}

impl Scheduler for EulerScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        self.sigmas = self.config.sigma_schedule(num_inference_steps);
        self.timesteps = self.sigmas[..num_inference_steps]
            .iter()
            .map(|sigma| sigma * 1000.0)
            .collect();
    }

    fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];

        // dx = (σ_next - σ) * v
        let dx = (model_output * (sigma_next - sigma))?;
        let dx = mean_shift(&dx, self.config.omega())?;

        // x_next = x + dx'
        Ok((sample + dx)?)
    }
}
