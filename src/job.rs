//! Job records and the table the queue keeps them in.
//!
//! [`JobTable`] is plain data; [`crate::manager::JobQueue`] wraps it in a
//! mutex and is the only writer. Every transition below is a single
//! read-modify-write on one record.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::CANCELLED_MESSAGE;
use crate::pipeline::{GenerationOutput, Provenance};
use crate::progress::{ProgressSnapshot, stage};
use crate::request::GenerationRequest;
use crate::sampler::CancelFlag;
use crate::{Error, Result};

/// Unique job identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid job id {s:?}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time copy of a job, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    /// Live 1-based queue position; only set while queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub task: String,
    pub caption: String,
    pub progress: ProgressSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub written: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    /// A queued job was cancelled and will never run.
    Cancelled,
    /// The running job was asked to stop at its next step.
    Requested,
    /// The job had already finished.
    AlreadyFinished,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub accepted: bool,
    pub message: String,
    pub kind: CancelKind,
}

impl CancelOutcome {
    fn new(kind: CancelKind, message: impl Into<String>) -> Self {
        Self {
            accepted: matches!(kind, CancelKind::Cancelled | CancelKind::Requested),
            message: message.into(),
            kind,
        }
    }
}

/// Progress update for one job, as sent to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub snapshot: ProgressSnapshot,
}

struct Job {
    status: JobStatus,
    task: String,
    caption: String,
    /// Taken by the worker when the job starts.
    request: Option<GenerationRequest>,
    cancel: CancelFlag,
    progress: ProgressSnapshot,
    error: Option<String>,
    provenance: Option<Provenance>,
    written: Vec<PathBuf>,
    /// Held only for succeeded jobs that wrote no files, until taken.
    output: Option<Arc<GenerationOutput>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// All jobs the queue knows about, in enqueue order.
///
/// At most `max_finished` terminal jobs are kept; the one that finished
/// earliest is forgotten first.
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    finished: VecDeque<JobId>,
    max_finished: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::with_retention(QueueConfig::default().max_finished_jobs)
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(max_finished: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            finished: VecDeque::new(),
            max_finished: max_finished.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Add a queued job. Returns its id and queue position.
    pub fn insert(&mut self, request: GenerationRequest) -> (JobId, usize) {
        let id = JobId::new();
        self.jobs.insert(
            id,
            Job {
                status: JobStatus::Queued,
                task: request.task.clone(),
                caption: request.caption.clone(),
                request: Some(request),
                cancel: CancelFlag::new(),
                progress: ProgressSnapshot::queued(),
                error: None,
                provenance: None,
                written: Vec::new(),
                output: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );
        self.order.push(id);
        let position = self.position(id).unwrap_or(1);
        (id, position)
    }

    /// Forget a job.
    pub fn remove(&mut self, id: JobId) {
        self.jobs.remove(&id);
        self.order.retain(|other| *other != id);
    }

    /// Record that `id` reached a terminal state and prune the oldest finished jobs.
    fn retire(&mut self, id: JobId) {
        self.finished.push_back(id);
        while self.finished.len() > self.max_finished {
            if let Some(oldest) = self.finished.pop_front() {
                tracing::debug!(job.id = %oldest, "forgetting finished job");
                self.remove(oldest);
            }
        }
    }

    /// Running jobs plus queued jobs ahead of `id`, plus one.
    fn position(&self, id: JobId) -> Option<usize> {
        if self.jobs.get(&id)?.status != JobStatus::Queued {
            return None;
        }
        let mut position = 1;
        for other in &self.order {
            if *other == id {
                return Some(position);
            }
            if let Some(job) = self.jobs.get(other)
                && !job.status.is_terminal()
            {
                position += 1;
            }
        }
        None
    }

    pub fn view(&self, id: JobId) -> Option<JobView> {
        let job = self.jobs.get(&id)?;
        Some(JobView {
            id,
            status: job.status,
            position: self.position(id),
            task: job.task.clone(),
            caption: job.caption.clone(),
            progress: job.progress.clone(),
            error: job.error.clone(),
            provenance: job.provenance.clone(),
            written: job.written.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        })
    }

    /// Views of every job in enqueue order.
    pub fn list(&self) -> Vec<JobView> {
        self.order.iter().filter_map(|id| self.view(*id)).collect()
    }

    pub fn output(&self, id: JobId) -> Option<Arc<GenerationOutput>> {
        self.jobs.get(&id)?.output.clone()
    }

    /// Hand the in-memory output to the caller and stop holding it.
    pub fn take_output(&mut self, id: JobId) -> Option<Arc<GenerationOutput>> {
        self.jobs.get_mut(&id)?.output.take()
    }

    pub fn cancel(&mut self, id: JobId) -> (CancelOutcome, Option<ProgressEvent>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return (CancelOutcome::new(CancelKind::NotFound, format!("job {id} not found")), None);
        };
        let result = match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.error = Some(CANCELLED_MESSAGE.to_string());
                job.finished_at = Some(Utc::now());
                job.request = None;
                job.progress = ProgressSnapshot {
                    stage: stage::CANCELLED.to_string(),
                    ..job.progress.clone()
                };
                let event = ProgressEvent {
                    job_id: id,
                    status: job.status,
                    snapshot: job.progress.clone(),
                };
                (CancelOutcome::new(CancelKind::Cancelled, "cancelled"), Some(event))
            }
            JobStatus::Running => {
                job.cancel.cancel();
                (CancelOutcome::new(CancelKind::Requested, "cancel requested"), None)
            }
            status => (
                CancelOutcome::new(
                    CancelKind::AlreadyFinished,
                    format!("job already {}", status_name(status)),
                ),
                None,
            ),
        };
        if result.1.is_some() {
            self.retire(id);
        }
        result
    }

    /// Move a queued job to running and hand its request to the worker.
    ///
    /// `None` for cancelled or unknown jobs, which the worker skips.
    pub fn start(&mut self, id: JobId) -> Option<(GenerationRequest, CancelFlag, ProgressEvent)> {
        let job = self.jobs.get_mut(&id)?;
        if job.status != JobStatus::Queued {
            return None;
        }
        let request = job.request.take()?;
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.progress = ProgressSnapshot::new(0.0, stage::LOADING_MODEL);
        let event = ProgressEvent {
            job_id: id,
            status: job.status,
            snapshot: job.progress.clone(),
        };
        Some((request, job.cancel.clone(), event))
    }

    /// Record progress for a running job.
    ///
    /// The fraction never moves backwards. Returns the stored snapshot.
    pub fn progress(&mut self, id: JobId, snapshot: &ProgressSnapshot) -> Option<ProgressEvent> {
        let job = self.jobs.get_mut(&id)?;
        if job.status != JobStatus::Running {
            return None;
        }
        job.progress = ProgressSnapshot {
            fraction: snapshot.fraction.max(job.progress.fraction),
            ..snapshot.clone()
        };
        Some(ProgressEvent {
            job_id: id,
            status: job.status,
            snapshot: job.progress.clone(),
        })
    }

    /// Set the terminal state of a running job. Later calls are ignored.
    pub fn finish(&mut self, id: JobId, result: Result<GenerationOutput>) -> Option<ProgressEvent> {
        let job = self.jobs.get_mut(&id)?;
        if job.status != JobStatus::Running {
            return None;
        }
        job.finished_at = Some(Utc::now());
        match result {
            Ok(output) => {
                job.status = JobStatus::Succeeded;
                job.progress = ProgressSnapshot::new(1.0, stage::COMPLETE);
                job.provenance = Some(output.provenance.clone());
                job.written = output.written.clone();
                // Written files replace the in-memory latents and waveforms.
                if output.written.is_empty() {
                    job.output = Some(Arc::new(output));
                }
            }
            Err(error) if error.is_cancelled() => {
                job.status = JobStatus::Cancelled;
                job.error = Some(CANCELLED_MESSAGE.to_string());
                job.progress.stage = stage::CANCELLED.to_string();
            }
            Err(error) => {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.progress.stage = stage::FAILED.to_string();
            }
        }
        let event = ProgressEvent {
            job_id: id,
            status: job.status,
            snapshot: job.progress.clone(),
        };
        self.retire(id);
        Some(event)
    }
}

fn status_name(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}
