//! Deterministic stand-in for a loaded model.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use candle_core::{DType, Device, Tensor};

use crate::audio::GeneratedAudio;
use crate::config::{EngineConfig, LatentConfig};
use crate::engine::{Conditioning, InferenceEngine, Prompt};
use crate::{Error, Result};

/// Counters and recordings shared between a [`MockEngine`] and the test.
#[derive(Default)]
pub struct MockStats {
    pub encode_text: AtomicUsize,
    pub predict: AtomicUsize,
    pub decode: AtomicUsize,
    pub encode_audio: AtomicUsize,
    pub load_adapter: AtomicUsize,
    pub unload_adapter: AtomicUsize,
    pub prompts: Mutex<Vec<Prompt>>,
    pub timesteps: Mutex<Vec<f64>>,
    /// Latent passed to each `predict`, in call order.
    pub inputs: Mutex<Vec<Tensor>>,
    /// Currently attached adapter (path, name) and its weight.
    pub attached: Mutex<Option<(PathBuf, String, f64)>>,
}

impl MockStats {
    pub fn predicts(&self) -> usize {
        self.predict.load(Ordering::SeqCst)
    }

    pub fn captions(&self) -> Vec<Option<String>> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.caption.clone())
            .collect()
    }

    pub fn attached_path(&self) -> Option<PathBuf> {
        self.attached.lock().unwrap().as_ref().map(|(p, _, _)| p.clone())
    }
}

/// Blocks `predict` calls until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

/// Mock inference engine.
///
/// `encode_text` embeds a prompt as a scalar: 0.0 unconditional, 0.5 caption
/// only, 1.0 caption + lyrics. `predict` returns `0.1 * latent + embedding`.
pub struct MockEngine {
    device: Device,
    stats: Arc<MockStats>,
    gate: Option<Arc<Gate>>,
    predict_error: Option<String>,
    panic_on_predict: bool,
    broken_adapter: Option<String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
            stats: Arc::new(MockStats::default()),
            gate: None,
            predict_error: None,
            panic_on_predict: false,
            broken_adapter: None,
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_predict(mut self, message: &str) -> Self {
        self.predict_error = Some(message.to_string());
        self
    }

    pub fn panicking_predict(mut self) -> Self {
        self.panic_on_predict = true;
        self
    }

    /// `load_adapter` fails for paths containing `needle`.
    pub fn with_broken_adapter(mut self, needle: &str) -> Self {
        self.broken_adapter = Some(needle.to_string());
        self
    }
}

impl InferenceEngine for MockEngine {
    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_text(&mut self, prompt: &Prompt) -> Result<Conditioning> {
        self.stats.encode_text.fetch_add(1, Ordering::SeqCst);
        self.stats.prompts.lock().unwrap().push(prompt.clone());
        let value = match (&prompt.caption, &prompt.lyrics) {
            (None, _) => 0.0f32,
            (Some(_), None) => 0.5,
            (Some(_), Some(_)) => 1.0,
        };
        Ok(Conditioning::new(Tensor::new(&[value], &self.device)?))
    }

    fn predict(&mut self, latent: &Tensor, timestep: f64, cond: &Conditioning) -> Result<Tensor> {
        self.stats.predict.fetch_add(1, Ordering::SeqCst);
        self.stats.timesteps.lock().unwrap().push(timestep);
        self.stats.inputs.lock().unwrap().push(latent.clone());
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if self.panic_on_predict {
            panic!("mock engine exploded");
        }
        if let Some(message) = &self.predict_error {
            return Err(Error::Inference(message.clone()));
        }
        let scaled = (latent * 0.1)?;
        Ok(scaled.broadcast_add(&cond.embedding.to_dtype(latent.dtype())?)?)
    }

    fn decode(&mut self, latent: &Tensor) -> Result<GeneratedAudio> {
        self.stats.decode.fetch_add(1, Ordering::SeqCst);
        // One stereo sample pair per latent frame, valued at the frame mean.
        let means: Vec<f32> = latent
            .to_dtype(DType::F32)?
            .mean_keepdim(1)?
            .mean_keepdim(2)?
            .flatten_all()?
            .to_vec1()?;
        let samples = means.iter().flat_map(|&m| [m, m]).collect();
        Ok(GeneratedAudio {
            samples,
            sample_rate: 44100,
            channels: 2,
        })
    }

    fn encode_audio(&mut self, audio: &GeneratedAudio) -> Result<Tensor> {
        self.stats.encode_audio.fetch_add(1, Ordering::SeqCst);
        let frames = audio.frames().max(1);
        Ok(Tensor::full(0.25f32, (1, 2, 2, frames), &self.device)?)
    }

    fn load_adapter(&mut self, path: &Path, name: &str) -> Result<()> {
        self.stats.load_adapter.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.broken_adapter
            && path.to_string_lossy().contains(needle.as_str())
        {
            return Err(Error::Adapter(format!("corrupt adapter {}", path.display())));
        }
        *self.stats.attached.lock().unwrap() = Some((path.to_path_buf(), name.to_string(), 0.0));
        Ok(())
    }

    fn unload_adapter(&mut self) -> Result<()> {
        self.stats.unload_adapter.fetch_add(1, Ordering::SeqCst);
        *self.stats.attached.lock().unwrap() = None;
        Ok(())
    }

    fn activate_adapters(&mut self, names: &[String], weights: &[f64]) -> Result<()> {
        let mut attached = self.stats.attached.lock().unwrap();
        match attached.as_mut() {
            Some((_, name, weight)) if names.first() == Some(name) => {
                *weight = weights.first().copied().unwrap_or(1.0);
                Ok(())
            }
            _ => Err(Error::Adapter(format!("no loaded adapter named {names:?}"))),
        }
    }
}

/// Latents `[1, channels, bands, frames]` whose value at frame `t` is `t`.
pub fn ramp_latents(channels: usize, bands: usize, frames: usize) -> Tensor {
    let data: Vec<f32> = (0..channels * bands)
        .flat_map(|_| (0..frames).map(|t| t as f32))
        .collect();
    Tensor::from_vec(data, (1, channels, bands, frames), &Device::Cpu).unwrap()
}

/// One latent frame per second with 2×2 latents, matching [`MockEngine`].
pub fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.latent = LatentConfig {
        sample_rate: 4096,
        hop_length: 512,
        time_compression: 8,
        channels: 2,
        bands: 2,
        max_duration_s: 240.0,
    };
    config.adapter.allow_remote = false;
    config
}
