//! The inference engine boundary.
//!
//! Neural networks (text encoder, denoiser, audio codec) live behind
//! [`InferenceEngine`]. The rest of the crate only moves tensors between its
//! methods. [`EngineHandle`] owns one engine on the job queue's worker thread,
//! loading it eagerly or on first use.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::audio::GeneratedAudio;
use crate::{Error, Result};

/// Text input to [`InferenceEngine::encode_text`].
///
/// `None` asks for the null (unconditional) embedding of that stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub caption: Option<String>,
    pub lyrics: Option<String>,
}

impl Prompt {
    pub fn new(caption: &str, lyrics: Option<&str>) -> Self {
        Self {
            caption: Some(caption.to_string()),
            lyrics: lyrics.map(str::to_string),
        }
    }

    /// Both streams nulled.
    pub fn unconditional() -> Self {
        Self::default()
    }

    /// Caption only, lyrics nulled. Used by double-condition guidance.
    pub fn text_only(caption: &str) -> Self {
        Self::new(caption, None)
    }
}

/// Encoder output passed back into [`InferenceEngine::predict`].
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub embedding: Tensor,
    pub mask: Option<Tensor>,
}

impl Conditioning {
    pub fn new(embedding: Tensor) -> Self {
        Self {
            embedding,
            mask: None,
        }
    }
}

/// Capabilities the generation core needs from a loaded model.
///
/// Latents are `[batch, channels, bands, frames]`.
pub trait InferenceEngine: Send {
    fn device(&self) -> &Device;

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn encode_text(&mut self, prompt: &Prompt) -> Result<Conditioning>;

    /// Velocity prediction at `timestep` (σ × 1000).
    fn predict(&mut self, latent: &Tensor, timestep: f64, cond: &Conditioning) -> Result<Tensor>;

    /// Decode one batch element `[1, channels, bands, frames]` to audio.
    fn decode(&mut self, latent: &Tensor) -> Result<GeneratedAudio>;

    /// Encode audio to latents `[1, channels, bands, frames]`.
    fn encode_audio(&mut self, audio: &GeneratedAudio) -> Result<Tensor>;

    fn load_adapter(&mut self, path: &Path, name: &str) -> Result<()>;

    fn unload_adapter(&mut self) -> Result<()>;

    fn activate_adapters(&mut self, names: &[String], weights: &[f64]) -> Result<()>;
}

type EngineFactory = Box<dyn FnMut() -> Result<Box<dyn InferenceEngine>> + Send>;

/// Owner of the single inference engine.
pub struct EngineHandle {
    engine: Option<Box<dyn InferenceEngine>>,
    factory: Option<EngineFactory>,
}

impl EngineHandle {
    /// Wrap an already-loaded engine.
    pub fn ready(engine: impl InferenceEngine + 'static) -> Self {
        Self {
            engine: Some(Box::new(engine)),
            factory: None,
        }
    }

    /// Load the engine on first use.
    ///
    /// A failing factory fails only the job that triggered it; the next call
    /// to [`EngineHandle::get`] runs it again.
    pub fn lazy<F>(factory: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn InferenceEngine>> + Send + 'static,
    {
        Self {
            engine: None,
            factory: Some(Box::new(factory)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    /// The engine, loading it if needed.
    pub fn get(&mut self) -> Result<&mut dyn InferenceEngine> {
        if self.engine.is_none() {
            let factory = self
                .factory
                .as_mut()
                .ok_or_else(|| Error::Manager("engine handle has neither engine nor factory".into()))?;
            tracing::info!("loading inference engine");
            let start = std::time::Instant::now();
            let engine = factory()?;
            tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "inference engine ready");
            self.engine = Some(engine);
        }
        match self.engine.as_deref_mut() {
            Some(engine) => Ok(engine),
            None => Err(Error::Manager("inference engine unavailable".into())),
        }
    }
}
