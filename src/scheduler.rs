//! Flow-matching diffusion schedulers.
//!
//! Three schedulers for the denoising loop, all using shifted flow-matching
//! sigma schedules with `shift=3.0`:
//!
//! - [`euler`]: first-order Euler integrator with omega mean-shifting
//! - [`heun`]: second-order predictor-corrector (2 model evals per step)
//! - [`pingpong`]: stochastic SDE variant with noise re-injection
//!
//! ## Flow-matching formulation
//!
//! The forward process interpolates: `x_t = (1 - σ) * x_0 + σ * ε`
//!
//! The model predicts velocity `v = x_1 - x_0` (direction from data to noise).
//!
//! The sigma schedule is shifted: `σ' = shift * σ / (1 + (shift - 1) * σ)`

pub mod euler;
pub mod heun;
pub mod pingpong;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::request::SchedulerKind;

pub use euler::EulerScheduler;
pub use heun::HeunScheduler;
pub use pingpong::PingPongScheduler;

/// Common interface for all schedulers.
///
/// Indices are logical steps: `sigmas()` has `N + 1` entries (terminal 0),
/// `timesteps()` has `N`. A scheduler that needs more than one model
/// evaluation per step reports it through [`Scheduler::evaluations`] and
/// expects `step()` to be called once per evaluation.
pub trait Scheduler: Send {
    /// Set up the timestep schedule for a given number of inference steps.
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Return the current sigma values.
    fn sigmas(&self) -> &[f64];

    /// Return the timestep values (sigmas × 1000, for the model).
    fn timesteps(&self) -> &[f64];

    /// Model evaluations needed for `step_index`.
    fn evaluations(&self, _step_index: usize) -> usize {
        1
    }

    /// Timestep the model is evaluated at for evaluation `eval` of `step_index`.
    fn eval_timestep(&self, step_index: usize, _eval: usize) -> f64 {
        self.timesteps()[step_index]
    }

    /// Perform one scheduler update.
    ///
    /// - `model_output`: (guided) velocity prediction
    /// - `sample`: current noisy latent
    /// - `step_index`: which logical step we're on
    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> crate::Result<Tensor>;
}

/// Configuration shared across all schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Sigma schedule shift factor (default: 3.0).
    #[serde(default = "default_shift")]
    pub shift: f64,

    /// Omega scaling factor for mean-shift (default: 10.0).
    #[serde(default = "default_omega_scale")]
    pub omega_scale: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            shift: default_shift(),
            omega_scale: default_omega_scale(),
        }
    }
}

impl SchedulerConfig {
    /// Compute the omega value from omega_scale via logistic function.
    ///
    /// `omega = 0.9 + 0.2 / (1 + exp(-0.1 * omega_scale))`
    pub fn omega(&self) -> f64 {
        0.9 + 0.2 / (1.0 + (-0.1 * self.omega_scale).exp())
    }

    /// Apply the shift to a raw sigma value.
    ///
    /// `σ' = shift * σ / (1 + (shift - 1) * σ)`
    pub fn shift_sigma(&self, sigma: f64) -> f64 {
        self.shift * sigma / (1.0 + (self.shift - 1.0) * sigma)
    }

    /// Shifted sigmas for `n` steps, linearly spaced from 1 to `1/num_train_timesteps`,
    /// followed by the terminal 0.
    pub fn sigma_schedule(&self, n: usize) -> Vec<f64> {
        let sigma_max = 1.0;
        let sigma_min = 1.0 / self.num_train_timesteps as f64;
        let mut sigmas = Vec::with_capacity(n + 1);
        for i in 0..n {
            let t = sigma_max - (sigma_max - sigma_min) * i as f64 / (n.max(2) - 1) as f64;
            sigmas.push(self.shift_sigma(t));
        }
        sigmas.push(0.0);
        sigmas
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_shift() -> f64 {
    3.0
}

fn default_omega_scale() -> f64 {
    10.0
}

/// Build a scheduler of the requested kind with its timesteps already set.
///
/// `seed` only matters for [`SchedulerKind::PingPong`], which re-injects noise.
pub fn build(
    kind: SchedulerKind,
    config: SchedulerConfig,
    num_inference_steps: usize,
    seed: u64,
) -> Box<dyn Scheduler> {
    let mut scheduler: Box<dyn Scheduler> = match kind {
        SchedulerKind::Euler => Box::new(EulerScheduler::new(config)),
        SchedulerKind::Heun => Box::new(HeunScheduler::new(config)),
        SchedulerKind::PingPong => Box::new(PingPongScheduler::new(config, seed)),
    };
    scheduler.set_timesteps(num_inference_steps);
    scheduler
}

/// `dx' = (dx - mean(dx)) * ω + mean(dx)`
pub(crate) fn mean_shift(dx: &Tensor, omega: f64) -> crate::Result<Tensor> {
    let mean = dx
        .mean_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_scalar::<f64>()?;
    let scaled = ((dx - mean)? * omega)?;
    Ok((scaled + mean)?)
}
