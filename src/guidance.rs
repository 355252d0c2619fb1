//! Classifier-free guidance variants.
//!
//! All combiners take the conditioned and unconditioned velocity predictions
//! for one step and return the guided velocity.
//!
//! - [`apg`]: adaptive projected guidance with a momentum buffer
//! - [`cfg`]: plain classifier-free guidance
//! - [`cfg_star`]: CFG-Zero* with a per-sample optimized unconditional scale
//! - [`double_condition`]: separate text and lyric scales
//!
//! [`GuidanceSchedule`] decides which steps are guided and at what scale.

use candle_core::{DType, Tensor};

use crate::config::GuidanceDefaults;
use crate::request::GuidanceKind;
use crate::Result;

/// Projection and norm clamping run along the frame axis.
const FRAME_DIM: usize = 3;

/// Exponential moving sum used by APG: `avg = update + momentum * avg`.
#[derive(Debug)]
pub struct MomentumBuffer {
    momentum: f64,
    running_average: Option<Tensor>,
}

impl MomentumBuffer {
    pub fn new(momentum: f64) -> Self {
        Self {
            momentum,
            running_average: None,
        }
    }

    pub fn update(&mut self, update: &Tensor) -> Result<Tensor> {
        let next = match &self.running_average {
            Some(average) => (update + (average * self.momentum)?)?,
            None => update.clone(),
        };
        self.running_average = Some(next.clone());
        Ok(next)
    }

    pub fn reset(&mut self) {
        self.running_average = None;
    }
}

/// `max(x, floor)` elementwise, with scalar ops only.
fn at_least(x: &Tensor, floor: f64) -> Result<Tensor> {
    Ok(((x - floor)?.relu()? + floor)?)
}

fn frame_norm(x: &Tensor) -> Result<Tensor> {
    Ok(x.sqr()?.sum_keepdim(FRAME_DIM)?.sqrt()?)
}

/// Adaptive projected guidance.
///
/// The (momentum-averaged) difference `cond - uncond` is clamped to
/// `norm_threshold` along the frame axis, split into components parallel and
/// orthogonal to `cond`, and applied as
/// `cond + (scale - 1) * (orthogonal + eta * parallel)`.
pub fn apg(
    cond: &Tensor,
    uncond: &Tensor,
    scale: f64,
    momentum: Option<&mut MomentumBuffer>,
    params: &GuidanceDefaults,
) -> Result<Tensor> {
    let dtype = cond.dtype();
    let cond64 = cond.to_dtype(DType::F64)?;
    let mut diff = (&cond64 - uncond.to_dtype(DType::F64)?)?;
    if let Some(buffer) = momentum {
        diff = buffer.update(&diff)?;
    }
    if params.apg_norm_threshold > 0.0 {
        let threshold = params.apg_norm_threshold;
        // min(1, threshold / norm) == threshold / max(norm, threshold)
        let factor = (at_least(&frame_norm(&diff)?, threshold)?.recip()? * threshold)?;
        diff = diff.broadcast_mul(&factor)?;
    }

    let unit = cond64.broadcast_div(&at_least(&frame_norm(&cond64)?, 1e-12)?)?;
    let parallel = (&diff * &unit)?.sum_keepdim(FRAME_DIM)?.broadcast_mul(&unit)?;
    let orthogonal = (&diff - &parallel)?;
    let update = (orthogonal + (parallel * params.apg_eta)?)?;
    let guided = (&cond64 + (update * (scale - 1.0))?)?;
    Ok(guided.to_dtype(dtype)?)
}

/// `uncond + scale * (cond - uncond)`.
pub fn cfg(cond: &Tensor, uncond: &Tensor, scale: f64) -> Result<Tensor> {
    Ok((uncond + ((cond - uncond)? * scale)?)?)
}

/// CFG-Zero*: `α·u + scale·(c − α·u)` with `α = ⟨c,u⟩ / (‖u‖² + 1e-8)` per sample.
///
/// Returns zeros when `zero_init` is set.
pub fn cfg_star(cond: &Tensor, uncond: &Tensor, scale: f64, zero_init: bool) -> Result<Tensor> {
    if zero_init {
        return Ok(cond.zeros_like()?);
    }
    let batch = cond.dim(0)?;
    let c = cond.to_dtype(DType::F64)?.flatten_from(1)?;
    let u = uncond.to_dtype(DType::F64)?.flatten_from(1)?;
    let dot = (&c * &u)?.sum_keepdim(1)?;
    let norm = (u.sqr()?.sum_keepdim(1)? + 1e-8)?;
    let alpha = (dot / norm)?
        .reshape((batch, 1, 1, 1))?
        .to_dtype(cond.dtype())?;
    let scaled_uncond = uncond.broadcast_mul(&alpha)?;
    Ok((&scaled_uncond + ((cond - &scaled_uncond)? * scale)?)?)
}

/// `(1 − gt)·u + (gt − gl)·t + gl·c`.
pub fn double_condition(
    cond: &Tensor,
    uncond: &Tensor,
    text_only: &Tensor,
    scale_text: f64,
    scale_lyric: f64,
) -> Result<Tensor> {
    let u = (uncond * (1.0 - scale_text))?;
    let t = (text_only * (scale_text - scale_lyric))?;
    let c = (cond * scale_lyric)?;
    Ok(((u + t)? + c)?)
}

/// Which steps get guidance and at what scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceSchedule {
    pub scale: f64,
    pub min_scale: f64,
    pub decay: f64,
    /// Guided steps are `[start, end)`.
    pub start: usize,
    pub end: usize,
}

impl GuidanceSchedule {
    /// Center a window covering `interval` of `steps`.
    ///
    /// `start = ⌊N·(1 − interval)/2⌋`, `end = ⌊N·(interval/2 + 0.5)⌋`.
    pub fn new(steps: usize, scale: f64, interval: f64, decay: f64, min_scale: f64) -> Self {
        let n = steps as f64;
        Self {
            scale,
            min_scale,
            decay,
            start: (n * (1.0 - interval) / 2.0).floor() as usize,
            end: ((n * (interval / 2.0 + 0.5)).floor() as usize).min(steps),
        }
    }

    /// Scales 0 and 1 both reduce guidance to the conditioned prediction.
    pub fn enabled(&self) -> bool {
        self.scale != 0.0 && self.scale != 1.0
    }

    pub fn is_guided(&self, step: usize) -> bool {
        self.enabled() && (self.start..self.end).contains(&step)
    }

    /// Scale at `step`, linearly decayed toward `min_scale` across the window.
    pub fn scale_at(&self, step: usize) -> f64 {
        if self.decay <= 0.0 {
            return self.scale;
        }
        let span = self.end.saturating_sub(self.start).saturating_sub(1);
        let progress = if span == 0 {
            0.0
        } else {
            step.saturating_sub(self.start) as f64 / span as f64
        };
        self.scale - (self.scale - self.min_scale) * progress * self.decay
    }
}

/// Stateful combiner for one sampling run.
pub struct Guider {
    kind: GuidanceKind,
    params: GuidanceDefaults,
    momentum: MomentumBuffer,
    cfg_star_zero_steps: usize,
    use_zero_init: bool,
    /// Text and lyric scales when double-condition guidance is on.
    double: Option<(f64, f64)>,
}

impl Guider {
    pub fn new(
        kind: GuidanceKind,
        params: GuidanceDefaults,
        cfg_star_zero_steps: usize,
        use_zero_init: bool,
        double: Option<(f64, f64)>,
    ) -> Self {
        Self {
            kind,
            momentum: MomentumBuffer::new(params.apg_momentum),
            params,
            cfg_star_zero_steps,
            use_zero_init,
            double,
        }
    }

    pub fn is_double(&self) -> bool {
        self.double.is_some()
    }

    /// Combine predictions for `step`. `text_only` is only read with
    /// double-condition guidance.
    pub fn combine(
        &mut self,
        step: usize,
        scale: f64,
        cond: &Tensor,
        uncond: &Tensor,
        text_only: Option<&Tensor>,
    ) -> Result<Tensor> {
        if let (Some((scale_text, scale_lyric)), Some(text_only)) = (self.double, text_only) {
            return double_condition(cond, uncond, text_only, scale_text, scale_lyric);
        }
        match self.kind {
            GuidanceKind::Apg => apg(cond, uncond, scale, Some(&mut self.momentum), &self.params),
            GuidanceKind::Cfg => cfg(cond, uncond, scale),
            GuidanceKind::CfgStar => {
                let zero = self.use_zero_init && step < self.cfg_star_zero_steps;
                cfg_star(cond, uncond, scale, zero)
            }
        }
    }
}
