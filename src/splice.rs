//! Frame-level planning and latent splicing for retake, repaint and extend.
//!
//! [`plan`] does all index math on plain integers. The resulting
//! [`FramePlan`] drives [`prepare_source`], which pads and trims the source
//! latents, and [`Splicer`], which keeps frames outside the regenerated
//! window on the source trajectory during sampling.
//!
//! Latents are `[batch, channels, bands, frames]`; frames are dim 3.

use std::f64::consts::FRAC_PI_2;

use candle_core::Tensor;
use serde::Serialize;

use crate::config::LatentConfig;
use crate::task::TaskKind;
use crate::{Error, Result};

const FRAME_DIM: usize = 3;

/// How the sampler treats the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpliceMode {
    /// No source; sample from pure noise.
    Generate,
    /// Regenerate the whole source with blended noise.
    Retake,
    /// Regenerate a window inside the source.
    Repaint,
    /// Regenerate a window that reaches past the source edges.
    Extend,
    /// Flow-edit the source, optionally restricted to a window.
    Edit,
}

/// Half-open frame range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameWindow {
    pub start: usize,
    pub end: usize,
}

impl FrameWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Result of frame planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FramePlan {
    pub mode: SpliceMode,
    /// Frames of the source buffer, 0 without one.
    pub source_frames: usize,
    /// Zero frames added before / after the source.
    pub pad_left: usize,
    pub pad_right: usize,
    /// Frames cut from the padded source before sampling and re-attached afterwards.
    pub trim_left: usize,
    pub trim_right: usize,
    /// Frames that go through the sampler.
    pub frames: usize,
    /// Regenerated window in sampler coordinates; `None` regenerates everything.
    pub window: Option<FrameWindow>,
}

impl FramePlan {
    fn whole(mode: SpliceMode, frames: usize) -> Self {
        Self {
            mode,
            source_frames: if mode == SpliceMode::Generate { 0 } else { frames },
            pad_left: 0,
            pad_right: 0,
            trim_left: 0,
            trim_right: 0,
            frames,
            window: None,
        }
    }

    /// Frames of the final buffer, trimmed frames included.
    pub fn output_frames(&self) -> usize {
        self.trim_left + self.frames + self.trim_right
    }

    /// First sampler step to run.
    ///
    /// - repaint: `⌊N·(1 − variance)⌋`
    /// - retake: first step with `σ ≤ 1 − strength`
    /// - everything else starts at 0
    ///
    /// Clamped to the last step so at least one step always runs.
    pub fn start_step(&self, sigmas: &[f64], retake_variance: f64, a2a_strength: f64) -> usize {
        let steps = sigmas.len().saturating_sub(1);
        if steps == 0 {
            return 0;
        }
        let start = match self.mode {
            SpliceMode::Repaint => (steps as f64 * (1.0 - retake_variance)).floor() as usize,
            SpliceMode::Retake => {
                let threshold = 1.0 - a2a_strength;
                sigmas[..steps]
                    .iter()
                    .position(|&sigma| sigma <= threshold)
                    .unwrap_or(steps)
            }
            SpliceMode::Generate | SpliceMode::Extend | SpliceMode::Edit => 0,
        };
        start.min(steps - 1)
    }
}

/// Plan the frame layout of one sampler run.
///
/// `window_s` is the repaint window in seconds; it is only read for
/// repaint, extend and edit.
pub fn plan(
    task: TaskKind,
    source_frames: Option<usize>,
    target_frames: usize,
    window_s: (f64, f64),
    latent: &LatentConfig,
) -> Result<FramePlan> {
    let max = latent.max_frames();
    let source = || {
        source_frames
            .filter(|&frames| frames > 0)
            .ok_or_else(|| Error::validation(format!("{task} needs non-empty source latents")))
    };

    match task {
        TaskKind::TextToMusic => {
            if target_frames == 0 {
                return Err(Error::validation("duration is shorter than one latent frame"));
            }
            if target_frames > max {
                return Err(Error::validation(format!(
                    "{target_frames} frames exceed the {max} frame ceiling"
                )));
            }
            Ok(FramePlan::whole(SpliceMode::Generate, target_frames))
        }
        TaskKind::Retake => {
            let frames = source()?;
            check_ceiling(frames, max)?;
            Ok(FramePlan::whole(SpliceMode::Retake, frames))
        }
        TaskKind::Edit => {
            let frames = source()?;
            check_ceiling(frames, max)?;
            let mut plan = FramePlan::whole(SpliceMode::Edit, frames);
            if window_s.1 > window_s.0 {
                let start = latent.frame_at(window_s.0).clamp(0, frames as i64) as usize;
                let end = latent.frame_at(window_s.1).clamp(0, frames as i64) as usize;
                let window = FrameWindow { start, end };
                if !window.is_empty() && window.len() < frames {
                    plan.window = Some(window);
                }
            }
            Ok(plan)
        }
        TaskKind::Repaint | TaskKind::Extend => {
            plan_window(source()?, latent.frame_at(window_s.0), latent.frame_at(window_s.1), max)
        }
    }
}

fn check_ceiling(frames: usize, max: usize) -> Result<()> {
    if frames > max {
        return Err(Error::validation(format!(
            "source has {frames} frames, more than the {max} frame ceiling"
        )));
    }
    Ok(())
}

/// Shared repaint/extend planner over signed source-frame coordinates.
fn plan_window(source: usize, start: i64, end: i64, max: usize) -> Result<FramePlan> {
    if end <= start {
        return Err(Error::validation(format!(
            "repaint window [{start}, {end}) frames is empty"
        )));
    }
    let len = source as i64;
    // Sharing an edge with the source is enough; a gap is not.
    if end < 0 || start > len {
        return Err(Error::validation(format!(
            "repaint window [{start}, {end}) leaves a gap from the {source} source frames"
        )));
    }
    if start == 0 && end == len {
        check_ceiling(source, max)?;
        return Ok(FramePlan::whole(SpliceMode::Retake, source));
    }

    let pad_left = (-start).max(0) as usize;
    let pad_right = (end - len).max(0) as usize;
    let padded = pad_left + source + pad_right;
    let mut window = FrameWindow {
        start: (start + pad_left as i64) as usize,
        end: (end + pad_left as i64) as usize,
    };

    let excess = padded.saturating_sub(max);
    let trim_right = excess.min(padded - window.end);
    let trim_left = (excess - trim_right).min(window.start);
    if trim_left + trim_right < excess {
        return Err(Error::validation(format!(
            "window of {} frames does not fit the {max} frame ceiling",
            window.len()
        )));
    }
    window.start -= trim_left;
    window.end -= trim_left;

    let mode = if pad_left > 0 || pad_right > 0 {
        SpliceMode::Extend
    } else {
        SpliceMode::Repaint
    };
    Ok(FramePlan {
        mode,
        source_frames: source,
        pad_left,
        pad_right,
        trim_left,
        trim_right,
        frames: padded - trim_left - trim_right,
        window: Some(window),
    })
}

/// Source latents laid out for the sampler, plus the trimmed edges.
pub struct PreparedSource {
    /// `[batch, C, H, plan.frames]`.
    pub latents: Tensor,
    pub head: Option<Tensor>,
    pub tail: Option<Tensor>,
}

/// Pad, trim and batch-broadcast source latents according to `plan`.
pub fn prepare_source(source: &Tensor, plan: &FramePlan, batch: usize) -> Result<PreparedSource> {
    let (b, c, h, f) = source.dims4()?;
    if f != plan.source_frames {
        return Err(Error::Inference(format!(
            "source has {f} frames, plan expects {}",
            plan.source_frames
        )));
    }
    if b != 1 && b != batch {
        return Err(Error::Inference(format!(
            "source batch {b} does not match request batch {batch}"
        )));
    }
    let source = if b == batch {
        source.clone()
    } else {
        source.broadcast_as((batch, c, h, f))?.contiguous()?
    };

    let mut pieces = Vec::with_capacity(3);
    if plan.pad_left > 0 {
        pieces.push(Tensor::zeros((batch, c, h, plan.pad_left), source.dtype(), source.device())?);
    }
    pieces.push(source.clone());
    if plan.pad_right > 0 {
        pieces.push(Tensor::zeros((batch, c, h, plan.pad_right), source.dtype(), source.device())?);
    }
    let padded = if pieces.len() == 1 {
        source
    } else {
        Tensor::cat(&pieces, FRAME_DIM)?
    };

    let total = padded.dim(FRAME_DIM)?;
    let head = (plan.trim_left > 0)
        .then(|| padded.narrow(FRAME_DIM, 0, plan.trim_left))
        .transpose()?;
    let tail = (plan.trim_right > 0)
        .then(|| padded.narrow(FRAME_DIM, total - plan.trim_right, plan.trim_right))
        .transpose()?;
    let latents = padded.narrow(FRAME_DIM, plan.trim_left, plan.frames)?;
    Ok(PreparedSource {
        latents,
        head,
        tail,
    })
}

/// Put trimmed edges back around sampled latents.
pub fn reattach(sampled: &Tensor, head: Option<&Tensor>, tail: Option<&Tensor>) -> Result<Tensor> {
    if head.is_none() && tail.is_none() {
        return Ok(sampled.clone());
    }
    let mut pieces = Vec::with_capacity(3);
    pieces.extend(head.cloned());
    pieces.push(sampled.clone());
    pieces.extend(tail.cloned());
    Ok(Tensor::cat(&pieces, FRAME_DIM)?)
}

/// `cos(vπ/2)·n1 + sin(vπ/2)·n2`.
pub fn retake_blend(n1: &Tensor, n2: &Tensor, variance: f64) -> Result<Tensor> {
    let angle = variance * FRAC_PI_2;
    Ok(((n1 * angle.cos())? + (n2 * angle.sin())?)?)
}

/// `(1 − σ)·x0 + σ·z0`; `x0` itself at σ = 0.
pub fn noised(x0: &Tensor, z0: &Tensor, sigma: f64) -> Result<Tensor> {
    if sigma == 0.0 {
        return Ok(x0.clone());
    }
    Ok(((x0 * (1.0 - sigma))? + (z0 * sigma)?)?)
}

/// Frames of `inside` within `window`, frames of `outside` elsewhere.
pub fn splice_window(inside: &Tensor, outside: &Tensor, window: FrameWindow) -> Result<Tensor> {
    let frames = inside.dim(FRAME_DIM)?;
    let mut pieces = Vec::with_capacity(3);
    if window.start > 0 {
        pieces.push(outside.narrow(FRAME_DIM, 0, window.start)?);
    }
    if !window.is_empty() {
        pieces.push(inside.narrow(FRAME_DIM, window.start, window.len())?);
    }
    if window.end < frames {
        pieces.push(outside.narrow(FRAME_DIM, window.end, frames - window.end)?);
    }
    if pieces.len() == 1 {
        return Ok(pieces.remove(0));
    }
    Ok(Tensor::cat(&pieces, FRAME_DIM)?)
}

/// Keeps frames outside a window on the source's noising trajectory.
pub struct Splicer {
    x0: Tensor,
    z0: Tensor,
    window: FrameWindow,
}

impl Splicer {
    /// `z0` is the retake blend inside the window and `n1` outside it.
    pub fn new(x0: Tensor, n1: &Tensor, blend: &Tensor, window: FrameWindow) -> Result<Self> {
        let z0 = splice_window(blend, n1, window)?;
        Ok(Self { x0, z0, window })
    }

    pub fn window(&self) -> FrameWindow {
        self.window
    }

    /// Source at noise level `sigma`.
    pub fn source_at(&self, sigma: f64) -> Result<Tensor> {
        noised(&self.x0, &self.z0, sigma)
    }

    /// Overwrite frames outside the window with the source at `sigma_next`.
    pub fn splice(&self, latent: &Tensor, sigma_next: f64) -> Result<Tensor> {
        let outside = self.source_at(sigma_next)?;
        splice_window(latent, &outside, self.window)
    }
}
