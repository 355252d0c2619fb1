//! The denoising loop.
//!
//! [`sample`] walks the scheduler's sigmas from a start step to σ = 0. Each
//! step checks for cancellation, evaluates the guided velocity once per
//! scheduler evaluation, applies the update, splices preserved frames back in
//! and reports progress. The flow-edit variant lives in [`edit`].

pub mod edit;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::Tensor;

use crate::engine::{Conditioning, InferenceEngine};
use crate::guidance::{GuidanceSchedule, Guider};
use crate::progress::{EtaClock, ProgressSink, ProgressSnapshot, stage};
use crate::scheduler::Scheduler;
use crate::splice::Splicer;
use crate::{Error, Result};

/// Cooperative cancellation flag shared between a job record and its run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Encoded prompts for one run.
#[derive(Debug, Clone)]
pub struct Conditions {
    pub cond: Conditioning,
    pub uncond: Conditioning,
    /// Caption with lyrics nulled; present only for double-condition guidance.
    pub text_only: Option<Conditioning>,
}

/// Everything [`sample`] needs besides the engine and the starting latent.
pub struct SampleRun<'a> {
    pub scheduler: &'a mut dyn Scheduler,
    pub guider: &'a mut Guider,
    pub schedule: GuidanceSchedule,
    pub start_step: usize,
    pub splicer: Option<&'a Splicer>,
    pub progress: &'a dyn ProgressSink,
    pub cancel: &'a CancelFlag,
}

/// Velocity at `timestep`, guided when `step` is inside the guidance window.
pub(crate) fn guided_velocity(
    engine: &mut dyn InferenceEngine,
    conditions: &Conditions,
    latent: &Tensor,
    timestep: f64,
    step: usize,
    guider: &mut Guider,
    schedule: &GuidanceSchedule,
) -> Result<Tensor> {
    let cond = engine.predict(latent, timestep, &conditions.cond)?;
    if !schedule.is_guided(step) {
        return Ok(cond);
    }
    let uncond = engine.predict(latent, timestep, &conditions.uncond)?;
    let text_only = match (&conditions.text_only, guider.is_double()) {
        (Some(text), true) => Some(engine.predict(latent, timestep, text)?),
        _ => None,
    };
    guider.combine(step, schedule.scale_at(step), &cond, &uncond, text_only.as_ref())
}

/// Per-step progress, `(step + 1) / N` with counters and ETA.
pub(crate) fn report_step(
    progress: &dyn ProgressSink,
    clock: &EtaClock,
    step: usize,
    start_step: usize,
    steps: usize,
) {
    let done = step + 1;
    let snapshot = ProgressSnapshot::new(done as f64 / steps as f64, stage::SAMPLING)
        .with_steps(done, steps)
        .with_eta(clock.eta(done - start_step, steps - start_step));
    progress.on_step(&snapshot);
}

/// Run the denoising loop from `run.start_step` to the end of the schedule.
pub fn sample(
    engine: &mut dyn InferenceEngine,
    conditions: &Conditions,
    init: Tensor,
    run: SampleRun<'_>,
) -> Result<Tensor> {
    let SampleRun {
        scheduler,
        guider,
        schedule,
        start_step,
        splicer,
        progress,
        cancel,
    } = run;
    let sigmas = scheduler.sigmas().to_vec();
    let steps = sigmas.len().saturating_sub(1);
    if start_step >= steps {
        return Err(Error::validation(format!(
            "start step {start_step} is outside a {steps} step schedule"
        )));
    }

    tracing::debug!(
        steps,
        start_step,
        guided_from = schedule.start,
        guided_to = schedule.end,
        guidance_enabled = schedule.enabled(),
        spliced = splicer.is_some(),
        "sampling"
    );

    let clock = EtaClock::start();
    let mut latent = init;
    for step in start_step..steps {
        cancel.check()?;
        for eval in 0..scheduler.evaluations(step) {
            let timestep = scheduler.eval_timestep(step, eval);
            let velocity = guided_velocity(
                engine, conditions, &latent, timestep, step, guider, &schedule,
            )?;
            latent = scheduler.step(&velocity, &latent, step)?;
        }
        if let Some(splicer) = splicer {
            latent = splicer.splice(&latent, sigmas[step + 1])?;
        }
        tracing::trace!(step, sigma = sigmas[step], "sampler step");
        report_step(progress, &clock, step, start_step, steps);
    }
    Ok(latent)
}
