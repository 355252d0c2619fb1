//! Engine configuration.
//!
//! Every section has defaults matching the ACE-Step v1 pipeline, so an empty
//! JSON object (`{}`) is a valid configuration file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Top-level configuration for the generation engine and its job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub latent: LatentConfig,
    pub scheduler: SchedulerConfig,
    pub guidance: GuidanceDefaults,
    pub adapter: AdapterConfig,
    pub progress: ProgressConfig,
    pub queue: QueueConfig,
    /// Decode the final latents to a waveform. When false, jobs return latents only.
    pub decode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            latent: LatentConfig::default(),
            scheduler: SchedulerConfig::default(),
            guidance: GuidanceDefaults::default(),
            adapter: AdapterConfig::default(),
            progress: ProgressConfig::default(),
            queue: QueueConfig::default(),
            decode: true,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        self.latent.validate()?;
        if self.scheduler.num_train_timesteps == 0 {
            return Err(Error::Config("scheduler.num_train_timesteps must be > 0".into()));
        }
        if !(self.scheduler.shift.is_finite() && self.scheduler.shift > 0.0) {
            return Err(Error::Config(format!(
                "scheduler.shift must be positive, got {}",
                self.scheduler.shift
            )));
        }
        if !(0.0..1.0).contains(&self.progress.decode_share) {
            return Err(Error::Config(format!(
                "progress.decode_share must be in [0, 1), got {}",
                self.progress.decode_share
            )));
        }
        if self.progress.channel_capacity == 0 {
            return Err(Error::Config("progress.channel_capacity must be > 0".into()));
        }
        if self.queue.max_finished_jobs == 0 {
            return Err(Error::Config("queue.max_finished_jobs must be > 0".into()));
        }
        if self.adapter.weight_extensions.is_empty() {
            return Err(Error::Config("adapter.weight_extensions must not be empty".into()));
        }
        Ok(())
    }
}

/// Geometry of the latent space the inference engine works in.
///
/// Latents are `[batch, channels, bands, frames]`; one frame covers
/// `hop_length * time_compression` audio samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentConfig {
    pub sample_rate: u32,
    pub hop_length: usize,
    pub time_compression: usize,
    pub channels: usize,
    pub bands: usize,
    /// Hard ceiling on frames fed through the sampler, in seconds.
    pub max_duration_s: f64,
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            hop_length: 512,
            time_compression: 8,
            channels: 8,
            bands: 16,
            max_duration_s: 240.0,
        }
    }
}

impl LatentConfig {
    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.hop_length == 0 || self.time_compression == 0 {
            return Err(Error::Config(
                "latent.sample_rate, hop_length and time_compression must be > 0".into(),
            ));
        }
        if self.channels == 0 || self.bands == 0 {
            return Err(Error::Config("latent.channels and bands must be > 0".into()));
        }
        if self.max_frames() == 0 {
            return Err(Error::Config(format!(
                "latent.max_duration_s too small: {}",
                self.max_duration_s
            )));
        }
        Ok(())
    }

    /// Latent frames per second.
    pub fn latent_fps(&self) -> f64 {
        self.sample_rate as f64 / (self.hop_length * self.time_compression) as f64
    }

    /// Signed frame index for a time in seconds, truncating toward zero.
    ///
    /// Negative times map to negative indices; extend windows rely on this.
    pub fn frame_at(&self, seconds: f64) -> i64 {
        (seconds * self.latent_fps()) as i64
    }

    /// Number of frames covering `duration_s`.
    pub fn frames_for(&self, duration_s: f64) -> usize {
        self.frame_at(duration_s).max(0) as usize
    }

    /// Duration in seconds covered by `frames`.
    pub fn duration_of(&self, frames: usize) -> f64 {
        frames as f64 / self.latent_fps()
    }

    /// Ceiling on the number of frames one sampler run may cover.
    pub fn max_frames(&self) -> usize {
        self.frames_for(self.max_duration_s)
    }
}

/// Constants of the guidance strategies that are not per-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceDefaults {
    /// APG momentum applied to the running average of guidance directions.
    pub apg_momentum: f64,
    /// APG clamps the guidance direction's L2 norm to this value (0 disables).
    pub apg_norm_threshold: f64,
    /// Weight of the parallel component in the APG update.
    pub apg_eta: f64,
}

impl Default for GuidanceDefaults {
    fn default() -> Self {
        Self {
            apg_momentum: -0.75,
            apg_norm_threshold: 2.5,
            apg_eta: 0.0,
        }
    }
}

/// Adapter weight resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// File extensions recognized as adapter weights, without the dot.
    pub weight_extensions: Vec<String>,
    /// Fall back to downloading from the HuggingFace Hub.
    pub allow_remote: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            weight_extensions: vec!["safetensors".into(), "bin".into(), "pt".into()],
            allow_remote: true,
        }
    }
}

/// Progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Capacity of the broadcast channel; slow subscribers lag past it.
    pub channel_capacity: usize,
    /// Share of the overall progress window reserved for decoding.
    pub decode_share: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            decode_share: 0.1,
        }
    }
}

/// Job retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Finished jobs kept for `status` and `list`; older ones are forgotten first.
    pub max_finished_jobs: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_finished_jobs: 128 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_latent_geometry() {
        let latent = LatentConfig::default();
        // 44100 / 512 / 8 ≈ 10.77 frames per second
        assert!((latent.latent_fps() - 10.7666).abs() < 1e-3);
        assert_eq!(latent.frames_for(30.0), 322);
        assert_eq!(latent.max_frames(), 2583);
    }

    #[test]
    fn test_frame_at_truncates_toward_zero() {
        let latent = LatentConfig::default();
        assert_eq!(latent.frame_at(-1.0), -10);
        assert_eq!(latent.frame_at(1.0), 10);
        assert_eq!(latent.frame_at(0.0), 0);
    }

    #[test]
    fn test_empty_json_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{}").unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.latent.channels, 8);
        assert_eq!(config.guidance.apg_momentum, -0.75);
        assert!((config.scheduler.shift - 3.0).abs() < 1e-12);
        assert!(config.adapter.allow_remote);
        assert_eq!(config.queue.max_finished_jobs, 128);
        assert!(config.decode);
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"latent": {"channels": 2, "bands": 4}, "decode": false}"#)
                .unwrap();
        assert_eq!(config.latent.channels, 2);
        assert_eq!(config.latent.bands, 4);
        assert_eq!(config.latent.sample_rate, 44100);
        assert!(!config.decode);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.progress.decode_share = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.queue.max_finished_jobs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
