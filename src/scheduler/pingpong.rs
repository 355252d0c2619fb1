//! PingPong flow-matching scheduler (stochastic SDE variant).
//!
//! Mixes the denoised estimate with fresh noise at each step:
//! ```text
//! x_0_hat = x_t - σ * v
//! x_{t-1} = (1 - σ_next) * x_0_hat + σ_next * ε
//! ```
//! where `ε ~ N(0, I)` is fresh noise drawn each step.
//!
//! Noise comes from a seeded [`NoiseGenerator`] so runs are reproducible.

use candle_core::Tensor;

use super::{Scheduler, SchedulerConfig};
use crate::Result;
use crate::noise::{NoiseGenerator, batch_seeds};

/// Mixed into the request seed so the re-injected noise does not replay the
/// initial latent noise.
const PINGPONG_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// PingPong stochastic flow-matching scheduler.
pub struct PingPongScheduler {
    config: SchedulerConfig,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
    seed: u64,
    noise: Option<NoiseGenerator>,
}

impl PingPongScheduler {
    pub fn new(config: SchedulerConfig, seed: u64) -> Self {
        Self {
            config,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
            seed: seed ^ PINGPONG_SEED_SALT,
            noise: None,
        }
    }

    /// One generator per batch element, created lazily once the batch size is known.
    fn noise_for(&mut self, batch: usize) -> &mut NoiseGenerator {
        if self.noise.as_ref().is_some_and(|n| n.batch_size() != batch) {
            self.noise = None;
        }
        let seed = self.seed;
        self.noise
            .get_or_insert_with(|| NoiseGenerator::new(&batch_seeds(seed, batch)))
    }
}

impl Scheduler for PingPongScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        self.sigmas = self.config.sigma_schedule(num_inference_steps);
        self.timesteps = self.sigmas[..num_inference_steps]
            .iter()
            .map(|sigma| sigma * 1000.0)
            .collect();
        self.noise = None;
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

        // Estimate x_0: x_0_hat = x_t - σ * v
        let denoised = (sample - (model_output * sigma)?)?;

        if sigma_next.abs() < 1e-10 {
            // Last step: just return the denoised estimate.
            return Ok(denoised);
        }

        // Re-inject noise: x_{t-1} = (1 - σ_next) * x_0_hat + σ_next * ε
        let batch = sample.dim(0)?;
        let noise = self.noise_for(batch).randn_like(sample)?;

        let denoised_scaled = (&denoised * (1.0 - sigma_next))?;
        let noise_scaled = (noise * sigma_next)?;
        Ok((denoised_scaled + noise_scaled)?)
    }
}
