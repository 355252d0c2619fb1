//! Progress reporting from engine internals.
//!
//! The sampler and pipeline push [`ProgressSnapshot`]s into a [`ProgressSink`].
//! Sinks must not block: the job queue's sink records the snapshot and
//! broadcasts it, the default [`NoopProgress`] drops it.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Stage labels used by the pipeline and the job queue.
pub mod stage {
    pub const QUEUED: &str = "queued";
    pub const LOADING_MODEL: &str = "loading model";
    pub const APPLYING_ADAPTER: &str = "applying adapter";
    pub const ENCODING_TEXT: &str = "encoding text";
    pub const ENCODING_REFERENCE: &str = "encoding reference";
    pub const SAMPLING: &str = "sampling";
    pub const DECODING: &str = "decoding";
    pub const COMPLETE: &str = "complete";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

/// Point-in-time progress of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Overall completion in [0, 1].
    pub fraction: f64,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    /// Estimated seconds until the current stage finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_s: Option<f64>,
}

impl ProgressSnapshot {
    pub fn new(fraction: f64, stage: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            stage: stage.into(),
            step: None,
            total_steps: None,
            eta_s: None,
        }
    }

    pub fn queued() -> Self {
        Self::new(0.0, stage::QUEUED)
    }

    pub fn with_steps(mut self, step: usize, total_steps: usize) -> Self {
        self.step = Some(step);
        self.total_steps = Some(total_steps);
        self
    }

    pub fn with_eta(mut self, eta_s: Option<f64>) -> Self {
        self.eta_s = eta_s;
        self
    }
}

/// Receiver of progress updates.
pub trait ProgressSink: Send + Sync {
    fn on_step(&self, snapshot: &ProgressSnapshot);
}

/// Drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_step(&self, _snapshot: &ProgressSnapshot) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_step(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// Maps the `[0, 1]` progress of a sub-task into `[start, end]` of its parent.
pub struct ProgressWindow<'a> {
    inner: &'a dyn ProgressSink,
    start: f64,
    end: f64,
}

impl<'a> ProgressWindow<'a> {
    pub fn new(inner: &'a dyn ProgressSink, start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        Self {
            inner,
            start,
            end: end.clamp(start, 1.0),
        }
    }

    pub fn map(&self, fraction: f64) -> f64 {
        self.start + fraction.clamp(0.0, 1.0) * (self.end - self.start)
    }
}

impl ProgressSink for ProgressWindow<'_> {
    fn on_step(&self, snapshot: &ProgressSnapshot) {
        let mapped = ProgressSnapshot {
            fraction: self.map(snapshot.fraction),
            ..snapshot.clone()
        };
        self.inner.on_step(&mapped);
    }
}

/// Linear ETA from the average duration of completed steps.
#[derive(Debug, Clone)]
pub struct EtaClock {
    started: Instant,
}

impl EtaClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// `elapsed / done * (total - done)`; `None` before the first step completes.
    pub fn eta(&self, done: usize, total: usize) -> Option<f64> {
        if done == 0 {
            return None;
        }
        let per_step = self.started.elapsed().as_secs_f64() / done as f64;
        Some(per_step * total.saturating_sub(done) as f64)
    }
}
