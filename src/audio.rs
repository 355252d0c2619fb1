//! Audio I/O utilities.
//!
//! WAV read/write for reference audio and decoded results. Everything else
//! about audio (resampling, fades, loudness) belongs to the caller.

mod wav;

pub use wav::{read_wav, write_wav};

use std::path::Path;

use crate::Result;

/// A decoded waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAudio {
    /// Interleaved samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl GeneratedAudio {
    /// Load a WAV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let (samples, sample_rate, channels) = read_wav(path)?;
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Write as 32-bit float WAV.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_wav(path, &self.samples, self.sample_rate, self.channels)
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_s(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }
}
