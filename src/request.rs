//! Generation requests as submitted by callers.
//!
//! Every field has a default, so a JSON request only needs a caption:
//!
//! ```json
//! {"caption": "lo-fi hip hop, mellow piano", "duration_s": 30, "steps": 27}
//! ```

use std::path::PathBuf;

use candle_core::Tensor;
use serde::{Deserialize, Deserializer, Serialize};

use crate::audio::GeneratedAudio;
use crate::{Error, Result};

/// Lyrics value for instrumental tracks.
pub const INSTRUMENTAL: &str = "[instrumental]";

/// Identity meaning "no adapter attached".
pub const NO_ADAPTER: &str = "none";

/// Per-step update rule of the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Euler,
    Heun,
    #[serde(alias = "ping_pong", alias = "ping-pong")]
    PingPong,
}

/// How conditioned and unconditioned predictions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GuidanceKind {
    #[default]
    #[serde(rename = "apg")]
    Apg,
    #[serde(rename = "cfg")]
    Cfg,
    #[serde(rename = "cfg-star", alias = "cfg_star")]
    CfgStar,
}

/// Reference or source audio attached to a request.
///
/// Only [`AudioHandle::Path`] can be deserialized; a JSON handle is a path string.
#[derive(Debug, Clone)]
pub enum AudioHandle {
    /// WAV file on the local filesystem.
    Path(PathBuf),
    /// Already-loaded waveform; encoded through the inference engine.
    Waveform(GeneratedAudio),
    /// Latents `[batch, channels, bands, frames]` in the engine's latent space.
    Latents(Tensor),
}

impl<'de> Deserialize<'de> for AudioHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        PathBuf::deserialize(deserializer).map(AudioHandle::Path)
    }
}

impl AudioHandle {
    /// Short description for logs and provenance.
    pub fn describe(&self) -> String {
        match self {
            AudioHandle::Path(path) => path.display().to_string(),
            AudioHandle::Waveform(audio) => format!(
                "waveform({} samples @ {} Hz)",
                audio.samples.len(),
                audio.sample_rate
            ),
            AudioHandle::Latents(latents) => format!("latents{:?}", latents.dims()),
        }
    }
}

/// A generation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    /// Style / genre description.
    pub caption: String,
    /// Lyrics text, or [`INSTRUMENTAL`].
    pub lyrics: String,
    /// Target duration in seconds. Ignored when a reference buffer defines the length.
    pub duration_s: f64,
    pub steps: usize,
    pub batch_size: usize,

    pub scheduler: SchedulerKind,
    pub omega_scale: f64,

    pub guidance: GuidanceKind,
    pub guidance_scale: f64,
    /// Centered fraction of the steps that receive guidance.
    pub guidance_interval: f64,
    /// How far the scale decays toward `min_guidance_scale` across the interval (0 = none).
    pub guidance_interval_decay: f64,
    pub min_guidance_scale: f64,
    /// Leading steps predicted as zero with [`GuidanceKind::CfgStar`].
    pub cfg_star_zero_steps: usize,
    pub use_zero_init: bool,
    /// Text and lyric scales; both above 1 enables double-condition guidance.
    pub guidance_scale_text: f64,
    pub guidance_scale_lyric: f64,

    /// Raw task name; see [`crate::task::resolve`].
    pub task: String,
    pub audio_to_audio: bool,
    pub audio_to_audio_strength: f64,
    pub repaint_start_s: f64,
    pub repaint_end_s: f64,
    pub retake_variance: f64,
    pub reference_audio: Option<AudioHandle>,
    pub source_audio: Option<AudioHandle>,

    pub edit_target_caption: String,
    pub edit_target_lyrics: String,
    pub edit_n_min: f64,
    pub edit_n_max: f64,
    pub edit_n_avg: usize,

    /// Adapter path or hub repository; `None` or `"none"` detaches.
    pub adapter: Option<String>,
    pub adapter_weight: f64,

    /// 0 picks a random seed.
    pub seed: u64,
    /// Seed of the second noise stream used for retake/repaint blending; 0 = random.
    pub retake_seed: u64,

    /// Write the decoded waveform here as WAV.
    pub output_path: Option<PathBuf>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            caption: String::new(),
            lyrics: INSTRUMENTAL.to_string(),
            duration_s: 60.0,
            steps: 60,
            batch_size: 1,
            scheduler: SchedulerKind::Euler,
            omega_scale: 10.0,
            guidance: GuidanceKind::Apg,
            guidance_scale: 15.0,
            guidance_interval: 0.5,
            guidance_interval_decay: 0.0,
            min_guidance_scale: 3.0,
            cfg_star_zero_steps: 1,
            use_zero_init: true,
            guidance_scale_text: 0.0,
            guidance_scale_lyric: 0.0,
            task: "text_to_music".to_string(),
            audio_to_audio: false,
            audio_to_audio_strength: 0.5,
            repaint_start_s: 0.0,
            repaint_end_s: 0.0,
            retake_variance: 0.5,
            reference_audio: None,
            source_audio: None,
            edit_target_caption: String::new(),
            edit_target_lyrics: String::new(),
            edit_n_min: 0.0,
            edit_n_max: 1.0,
            edit_n_avg: 1,
            adapter: None,
            adapter_weight: 1.0,
            seed: 0,
            retake_seed: 0,
            output_path: None,
        }
    }
}

impl GenerationRequest {
    /// Convenience constructor for a text-to-music request.
    pub fn text_to_music(caption: impl Into<String>, duration_s: f64, steps: usize) -> Self {
        Self {
            caption: caption.into(),
            duration_s,
            steps,
            ..Default::default()
        }
    }

    /// Lyrics to condition on; `None` for instrumental tracks.
    pub fn lyrics_condition(&self) -> Option<&str> {
        lyrics_or_none(&self.lyrics)
    }

    /// Whether double-condition (text + lyric) guidance is requested.
    pub fn double_condition(&self) -> bool {
        self.guidance_scale_text > 1.0 && self.guidance_scale_lyric > 1.0
    }

    /// Field checks that do not depend on task resolution.
    pub fn validate_fields(&self) -> Result<()> {
        if self.caption.trim().is_empty() {
            return Err(Error::validation("caption must not be empty"));
        }
        if !(self.duration_s.is_finite() && self.duration_s > 0.0) {
            return Err(Error::validation(format!(
                "duration_s must be positive, got {}",
                self.duration_s
            )));
        }
        if self.steps == 0 {
            return Err(Error::validation("steps must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::validation("batch_size must be >= 1"));
        }
        if !self.guidance_scale.is_finite() || !self.min_guidance_scale.is_finite() {
            return Err(Error::validation("guidance scales must be finite"));
        }
        unit_interval("guidance_interval", self.guidance_interval)?;
        unit_interval("guidance_interval_decay", self.guidance_interval_decay)?;
        unit_interval("retake_variance", self.retake_variance)?;
        unit_interval("audio_to_audio_strength", self.audio_to_audio_strength)?;
        unit_interval("edit_n_min", self.edit_n_min)?;
        unit_interval("edit_n_max", self.edit_n_max)?;
        if self.edit_n_min > self.edit_n_max {
            return Err(Error::validation(format!(
                "edit_n_min ({}) must not exceed edit_n_max ({})",
                self.edit_n_min, self.edit_n_max
            )));
        }
        if self.edit_n_avg == 0 {
            return Err(Error::validation("edit_n_avg must be >= 1"));
        }
        if !self.adapter_weight.is_finite() {
            return Err(Error::validation("adapter_weight must be finite"));
        }
        if !(self.repaint_start_s.is_finite() && self.repaint_end_s.is_finite()) {
            return Err(Error::validation("repaint window must be finite"));
        }
        Ok(())
    }
}

/// Empty and instrumental lyrics both mean "no lyric conditioning".
pub(crate) fn lyrics_or_none(lyrics: &str) -> Option<&str> {
    let trimmed = lyrics.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(INSTRUMENTAL) {
        None
    } else {
        Some(lyrics)
    }
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::validation(format!("{name} must be in [0, 1], got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_request() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"caption": "ambient piano", "duration_s": 20}"#).unwrap();
        assert_eq!(req.caption, "ambient piano");
        assert_eq!(req.duration_s, 20.0);
        assert_eq!(req.steps, 60);
        assert_eq!(req.scheduler, SchedulerKind::Euler);
        assert_eq!(req.guidance, GuidanceKind::Apg);
        assert!(req.lyrics_condition().is_none());
        req.validate_fields().unwrap();
    }

    #[test]
    fn enum_spellings() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"caption": "x", "scheduler": "pingpong", "guidance": "cfg-star",
                "reference_audio": "/tmp/ref.wav"}"#,
        )
        .unwrap();
        assert_eq!(req.scheduler, SchedulerKind::PingPong);
        assert_eq!(req.guidance, GuidanceKind::CfgStar);
        assert!(matches!(req.reference_audio, Some(AudioHandle::Path(_))));

        let kind: GuidanceKind = serde_json::from_str(r#""cfg_star""#).unwrap();
        assert_eq!(kind, GuidanceKind::CfgStar);
    }

    #[test]
    fn rejects_bad_fields() {
        let bad = [
            GenerationRequest::text_to_music("", 10.0, 10),
            GenerationRequest::text_to_music("x", 0.0, 10),
            GenerationRequest::text_to_music("x", -3.0, 10),
            GenerationRequest::text_to_music("x", f64::NAN, 10),
            GenerationRequest::text_to_music("x", 10.0, 0),
            GenerationRequest {
                guidance_interval: 1.5,
                ..GenerationRequest::text_to_music("x", 10.0, 10)
            },
            GenerationRequest {
                edit_n_min: 0.8,
                edit_n_max: 0.2,
                ..GenerationRequest::text_to_music("x", 10.0, 10)
            },
        ];
        for req in bad {
            assert!(
                matches!(req.validate_fields(), Err(Error::Validation(_))),
                "{req:?}"
            );
        }
    }

    #[test]
    fn double_condition_needs_both_scales() {
        let mut req = GenerationRequest::text_to_music("x", 10.0, 10);
        assert!(!req.double_condition());
        req.guidance_scale_text = 5.0;
        assert!(!req.double_condition());
        req.guidance_scale_lyric = 1.5;
        assert!(req.double_condition());
    }

    #[test]
    fn instrumental_lyrics_are_unconditioned() {
        assert_eq!(lyrics_or_none("  [Instrumental] "), None);
        assert_eq!(lyrics_or_none(""), None);
        assert_eq!(lyrics_or_none("[verse]\nla la"), Some("[verse]\nla la"));
    }
}
