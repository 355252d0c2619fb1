//! Generation orchestration for ACE-Step music models.
//!
//! Everything between a caller's request and the model's forward passes:
//! task resolution, a single-slot job queue with cooperative cancellation,
//! adapter swapping, latent splicing for retake/repaint/extend, and the
//! flow-matching sampler with APG / CFG / CFG-star guidance and flow-edit.
//! The model itself sits behind the [`engine::InferenceEngine`] trait.
//!
//! ## Architecture
//!
//! ```text
//! request ─→ task resolver ─→ job queue (FIFO, one slot)
//!                                  ↓ worker thread
//!                             adapter cache ─→ InferenceEngine::load_adapter
//!                                  ↓
//!                     encode_text / encode_audio
//!                                  ↓
//!            frame plan ─→ noise ─→ sampler ⇄ splicer ⇄ InferenceEngine::predict
//!                                  ↓
//!                     reattach ─→ InferenceEngine::decode ─→ WAV
//! ```
//!
//! ## Modules
//!
//! - [`task`]: task name parsing and reference-audio resolution
//! - [`manager`], [`job`]: job queue, job records, progress events
//! - [`pipeline`]: one request end to end, provenance
//! - [`adapter`]: adapter identity resolution and swapping
//! - [`splice`]: frame planning, padding, trimming, window splicing
//! - [`sampler`], [`scheduler`], [`guidance`]: the denoising loop
//! - [`daemon`]: Unix-socket JSON transport

pub mod adapter;
pub mod audio;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod guidance;
pub mod job;
pub mod manager;
pub mod noise;
pub mod pipeline;
pub mod progress;
pub mod request;
pub mod sampler;
pub mod scheduler;
pub mod splice;
pub mod task;

mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CANCELLED_MESSAGE, Error, Result};
pub use job::{CancelKind, CancelOutcome, JobId, JobStatus, JobView, ProgressEvent};
pub use manager::JobQueue;
pub use pipeline::{GenerationOutput, GenerationPipeline, Provenance};
pub use request::GenerationRequest;
