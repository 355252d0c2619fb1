//! Flow-edit: move a source buffer toward a target prompt without inverting it.
//!
//! For steps in `[n_min, n_max)` the edit state `z` is advanced by the
//! difference between target and source velocities evaluated on coupled
//! noisy samples:
//!
//! ```text
//! zs = (1 − σ)·src + σ·ε
//! zt = z + zs − src
//! z += (σ_next − σ) · mean_k(V_tar(zt) − V_src(zs))
//! ```
//!
//! From `n_max` on, plain target sampling continues from `z` re-noised to the
//! current level. Steps before `n_min` are skipped entirely.

use candle_core::Tensor;

use super::{CancelFlag, Conditions, guided_velocity, report_step};
use crate::engine::InferenceEngine;
use crate::guidance::{GuidanceSchedule, Guider};
use crate::noise::NoiseGenerator;
use crate::progress::{EtaClock, ProgressSink};
use crate::splice::{FrameWindow, noised, splice_window};
use crate::{Error, Result};

/// Parameters of one flow-edit run.
pub struct EditRun<'a> {
    /// Full schedule, `N + 1` entries ending at 0.
    pub sigmas: &'a [f64],
    pub schedule: GuidanceSchedule,
    pub source_guider: &'a mut Guider,
    pub target_guider: &'a mut Guider,
    /// Fraction of steps skipped before editing starts.
    pub n_min: f64,
    /// Fraction of steps after which plain target sampling takes over.
    pub n_max: f64,
    pub n_avg: usize,
    /// Frames outside this window follow the source.
    pub window: Option<FrameWindow>,
    pub noise: &'a mut NoiseGenerator,
    pub progress: &'a dyn ProgressSink,
    pub cancel: &'a CancelFlag,
}

/// Step range `[n_min, n_max)` of the edit phase for `steps` steps.
///
/// `n_min` is clamped so at least one step runs.
pub fn edit_steps(steps: usize, n_min: f64, n_max: f64) -> (usize, usize) {
    let n = steps as f64;
    let min = ((n * n_min).floor() as usize).min(steps.saturating_sub(1));
    let max = ((n * n_max).floor() as usize).max(min);
    (min, max)
}

/// Run flow-edit over `source` latents.
pub fn edit(
    engine: &mut dyn InferenceEngine,
    source_conditions: &Conditions,
    target_conditions: &Conditions,
    source: &Tensor,
    run: EditRun<'_>,
) -> Result<Tensor> {
    let EditRun {
        sigmas,
        schedule,
        source_guider,
        target_guider,
        n_min,
        n_max,
        n_avg,
        window,
        noise,
        progress,
        cancel,
    } = run;
    let steps = sigmas.len().saturating_sub(1);
    if steps == 0 {
        return Err(Error::validation("edit needs at least one step"));
    }
    let n_avg = n_avg.max(1);
    let (first, edit_end) = edit_steps(steps, n_min, n_max);
    tracing::debug!(steps, first, edit_end, n_avg, windowed = window.is_some(), "flow edit");

    let clock = EtaClock::start();
    let mut z_edit = source.clone();
    let mut z_target: Option<Tensor> = None;
    // Noise anchoring the preserved frames once plain sampling takes over.
    let mut anchor: Option<Tensor> = None;

    for step in first..steps {
        cancel.check()?;
        let sigma = sigmas[step];
        let sigma_next = sigmas[step + 1];
        let timestep = sigma * 1000.0;

        if step < edit_end {
            let mut delta: Option<Tensor> = None;
            for _ in 0..n_avg {
                let eps = noise.randn_like(source)?;
                let zs = noised(source, &eps, sigma)?;
                let zt = ((&z_edit + &zs)? - source)?;
                let v_src = guided_velocity(
                    engine, source_conditions, &zs, timestep, step, source_guider, &schedule,
                )?;
                let v_tar = guided_velocity(
                    engine, target_conditions, &zt, timestep, step, target_guider, &schedule,
                )?;
                let contribution = ((v_tar - v_src)? / n_avg as f64)?;
                delta = Some(match delta {
                    Some(sum) => (sum + contribution)?,
                    None => contribution,
                });
            }
            if let Some(delta) = delta {
                z_edit = (&z_edit + (delta * (sigma_next - sigma))?)?;
            }
            if let Some(window) = window {
                z_edit = splice_window(&z_edit, source, window)?;
            }
        } else {
            let current = match z_target.take() {
                Some(current) => current,
                None => {
                    let eps = noise.randn_like(source)?;
                    let xs = noised(source, &eps, sigma)?;
                    anchor = Some(eps);
                    ((&z_edit + xs)? - source)?
                }
            };
            let v = guided_velocity(
                engine, target_conditions, &current, timestep, step, target_guider, &schedule,
            )?;
            let mut next = (&current + (v * (sigma_next - sigma))?)?;
            if let (Some(window), Some(eps)) = (window, anchor.as_ref()) {
                let outside = noised(source, eps, sigma_next)?;
                next = splice_window(&next, &outside, window)?;
            }
            z_target = Some(next);
        }
        report_step(progress, &clock, step, first, steps);
    }

    Ok(z_target.unwrap_or(z_edit))
}
