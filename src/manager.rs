//! Job queue: one resident engine, one inference slot, FIFO order.
//!
//! [`JobQueue::start`] spawns a worker thread that owns the
//! [`EngineHandle`] and the [`GenerationPipeline`]. Callers enqueue requests
//! and poll or cancel them through the shared [`JobTable`]; none of those
//! calls wait on the worker.
//!
//! # Example
//!
//! ```no_run
//! use ace_step_engine::config::EngineConfig;
//! use ace_step_engine::engine::EngineHandle;
//! use ace_step_engine::manager::JobQueue;
//! use ace_step_engine::request::GenerationRequest;
//! # fn load() -> ace_step_engine::Result<Box<dyn ace_step_engine::engine::InferenceEngine>> { unimplemented!() }
//!
//! let queue = JobQueue::start(EngineConfig::default(), EngineHandle::lazy(load)).unwrap();
//! let (id, position) = queue
//!     .enqueue(GenerationRequest::text_to_music("ambient piano", 30.0, 27))
//!     .unwrap();
//! println!("job {id} queued at {position}");
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use crate::config::{EngineConfig, LatentConfig};
use crate::engine::EngineHandle;
use crate::job::{CancelOutcome, JobId, JobTable, JobView, ProgressEvent};
use crate::pipeline::{self, GenerationOutput, GenerationPipeline};
use crate::progress::{ProgressSink, ProgressSnapshot};
use crate::request::GenerationRequest;
use crate::{Error, Result};

/// State shared between callers and the worker.
struct Shared {
    table: Mutex<JobTable>,
    /// Notified whenever a job reaches a terminal state.
    settled: Condvar,
    events: broadcast::Sender<ProgressEvent>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: Option<ProgressEvent>) {
        // No receivers is fine.
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }
}

/// Forwards pipeline progress into the job record and the broadcast channel.
struct JobProgress<'a> {
    shared: &'a Shared,
    id: JobId,
}

impl ProgressSink for JobProgress<'_> {
    fn on_step(&self, snapshot: &ProgressSnapshot) {
        let event = self.shared.table().progress(self.id, snapshot);
        self.shared.publish(event);
    }
}

/// Handle to a running job queue.
pub struct JobQueue {
    shared: Arc<Shared>,
    latent: LatentConfig,
    intake: Mutex<Option<mpsc::UnboundedSender<JobId>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Validate `config` and start the worker.
    pub fn start(config: EngineConfig, engine: EngineHandle) -> Result<Self> {
        config.validate()?;
        Self::with_pipeline(GenerationPipeline::new(config), engine)
    }

    /// Start the worker around an existing pipeline.
    pub fn with_pipeline(pipeline: GenerationPipeline, engine: EngineHandle) -> Result<Self> {
        let latent = pipeline.config().latent.clone();
        let (events, _) = broadcast::channel(pipeline.config().progress.channel_capacity);
        let shared = Arc::new(Shared {
            table: Mutex::new(JobTable::with_retention(pipeline.config().queue.max_finished_jobs)),
            settled: Condvar::new(),
            events,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("ace-step-worker".into())
            .spawn(move || run_worker(worker_shared, pipeline, engine, rx))?;

        Ok(Self {
            shared,
            latent,
            intake: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Validate and queue a request. Returns the job id and its 1-based position.
    pub fn enqueue(&self, request: GenerationRequest) -> Result<(JobId, usize)> {
        let resolved = pipeline::validate(&request, &self.latent)?;
        let intake = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = intake
            .as_ref()
            .ok_or_else(|| Error::Manager("queue is shut down".into()))?;

        let mut table = self.shared.table();
        let (id, position) = table.insert(request);
        if tx.send(id).is_err() {
            table.remove(id);
            return Err(Error::Manager("worker is gone".into()));
        }
        tracing::info!(job.id = %id, task = %resolved.task, position, "job queued");
        Ok((id, position))
    }

    pub fn status(&self, id: JobId) -> Option<JobView> {
        self.shared.table().view(id)
    }

    pub fn list(&self) -> Vec<JobView> {
        self.shared.table().list()
    }

    /// Latents and audio of a succeeded job that wrote no files.
    ///
    /// Jobs with an output path keep only their provenance and written paths.
    pub fn output(&self, id: JobId) -> Option<Arc<GenerationOutput>> {
        self.shared.table().output(id)
    }

    /// Like [`JobQueue::output`], but the queue stops holding the output.
    pub fn take_output(&self, id: JobId) -> Option<Arc<GenerationOutput>> {
        self.shared.table().take_output(id)
    }

    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        let (outcome, event) = self.shared.table().cancel(id);
        tracing::info!(job.id = %id, kind = ?outcome.kind, "cancel");
        if event.is_some() {
            self.shared.settled.notify_all();
        }
        self.shared.publish(event);
        outcome
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    /// Block until the job is terminal or `timeout` passes, then return its view.
    pub fn wait(&self, id: JobId, timeout: Duration) -> Option<JobView> {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.table();
        loop {
            let view = table.view(id)?;
            let now = Instant::now();
            if view.status.is_terminal() || now >= deadline {
                return Some(view);
            }
            table = self
                .shared
                .settled
                .wait_timeout(table, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop accepting jobs, let the worker drain what is queued, and join it.
    pub fn shutdown(&self) {
        drop(self.intake.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            tracing::error!("worker thread panicked outside a job");
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        // Close intake; the worker finishes queued jobs on its own.
        drop(self.intake.lock().unwrap_or_else(PoisonError::into_inner).take());
    }
}

fn run_worker(
    shared: Arc<Shared>,
    mut pipeline: GenerationPipeline,
    mut engine: EngineHandle,
    mut rx: mpsc::UnboundedReceiver<JobId>,
) {
    while let Some(id) = rx.blocking_recv() {
        let Some((request, cancel, event)) = shared.table().start(id) else {
            tracing::debug!(job.id = %id, "skipping cancelled job");
            continue;
        };
        shared.publish(Some(event));
        tracing::info!(job.id = %id, caption = %request.caption, "job started");

        let progress = JobProgress {
            shared: &shared,
            id,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<GenerationOutput> {
            let engine = engine.get()?;
            pipeline.synthesize(engine, &request, &progress, &cancel)
        }));
        let result = outcome.unwrap_or_else(|panic| {
            Err(Error::Manager(format!("worker panicked: {}", panic_message(panic.as_ref()))))
        });

        match &result {
            Ok(output) => tracing::info!(
                job.id = %id,
                total_ms = output.provenance.timings.total_ms,
                "job succeeded"
            ),
            Err(error) if error.is_cancelled() => tracing::info!(job.id = %id, "job cancelled"),
            Err(error) => tracing::error!(job.id = %id, %error, "job failed"),
        }
        let event = shared.table().finish(id, result);
        shared.settled.notify_all();
        shared.publish(event);
    }
    tracing::info!("job queue shut down");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CANCELLED_MESSAGE;
    use crate::job::{CancelKind, JobStatus};
    use crate::testing::{Gate, MockEngine, small_config};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(10);
    const POLL: Duration = Duration::from_millis(10);

    fn queue(engine: MockEngine) -> JobQueue {
        JobQueue::start(small_config(), EngineHandle::ready(engine)).unwrap()
    }

    fn request(caption: &str) -> GenerationRequest {
        GenerationRequest::text_to_music(caption, 4.0, 3)
    }

    fn wait_running(queue: &JobQueue, id: JobId) {
        let deadline = Instant::now() + TIMEOUT;
        while queue.status(id).unwrap().status != JobStatus::Running {
            assert!(Instant::now() < deadline, "job never started");
            std::thread::sleep(POLL);
        }
    }

    #[test]
    fn jobs_run_in_fifo_order() {
        let engine = MockEngine::new();
        let stats = engine.stats();
        let queue = queue(engine);
        let ids: Vec<JobId> = ["A", "B", "C"]
            .iter()
            .map(|c| queue.enqueue(request(c)).unwrap().0)
            .collect();
        for id in &ids {
            assert_eq!(queue.wait(*id, TIMEOUT).unwrap().status, JobStatus::Succeeded);
        }

        let mut captions: Vec<String> = stats.captions().into_iter().flatten().collect();
        captions.dedup();
        assert_eq!(captions, ["A", "B", "C"]);

        let views: Vec<JobView> = ids.iter().map(|id| queue.status(*id).unwrap()).collect();
        for pair in views.windows(2) {
            assert!(pair[0].finished_at.unwrap() <= pair[1].started_at.unwrap());
        }
    }

    #[test]
    fn queued_positions_and_cancellation() {
        let gate = Gate::closed();
        let engine = MockEngine::new().with_gate(gate.clone());
        let stats = engine.stats();
        let queue = queue(engine);

        let (one, p1) = queue.enqueue(request("one")).unwrap();
        assert_eq!(p1, 1);
        wait_running(&queue, one);

        let (two, p2) = queue.enqueue(request("two")).unwrap();
        let (three, p3) = queue.enqueue(request("three")).unwrap();
        assert_eq!((p2, p3), (2, 3));
        assert_eq!(queue.status(two).unwrap().position, Some(2));
        assert_eq!(queue.status(three).unwrap().position, Some(3));
        assert_eq!(queue.status(one).unwrap().position, None);

        let outcome = queue.cancel(two);
        assert_eq!(outcome.kind, CancelKind::Cancelled);
        assert!(outcome.accepted);
        let view = queue.status(two).unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.position, None);
        assert_eq!(queue.status(three).unwrap().position, Some(2));

        gate.open();
        assert_eq!(queue.wait(one, TIMEOUT).unwrap().status, JobStatus::Succeeded);
        assert_eq!(queue.wait(three, TIMEOUT).unwrap().status, JobStatus::Succeeded);
        assert_eq!(queue.status(two).unwrap().status, JobStatus::Cancelled);
        assert!(!stats.captions().contains(&Some("two".to_string())));
    }

    #[test]
    fn running_job_cancels_cooperatively() {
        let gate = Gate::closed();
        let queue = queue(MockEngine::new().with_gate(gate.clone()));
        let (id, _) = queue.enqueue(request("long")).unwrap();
        wait_running(&queue, id);

        let outcome = queue.cancel(id);
        assert_eq!(outcome.kind, CancelKind::Requested);
        assert_eq!(outcome.message, "cancel requested");
        gate.open();

        let view = queue.wait(id, TIMEOUT).unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(queue.cancel(id).kind, CancelKind::AlreadyFinished);
    }

    #[test]
    fn progress_events_are_monotonic_and_end_at_one() {
        let queue = queue(MockEngine::new());
        let mut events = queue.subscribe();
        let (id, _) = queue.enqueue(request("x")).unwrap();
        assert_eq!(queue.wait(id, TIMEOUT).unwrap().status, JobStatus::Succeeded);

        let mut fractions = Vec::new();
        let mut last_status = JobStatus::Queued;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.job_id, id);
            fractions.push(event.snapshot.fraction);
            last_status = event.status;
        }
        assert!(fractions.len() > 3);
        assert_eq!(fractions[0], 0.0);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*fractions.last().unwrap(), 1.0);
        assert_eq!(last_status, JobStatus::Succeeded);
        assert!(queue.output(id).is_some());
    }

    #[test]
    fn failures_and_panics_do_not_stop_the_worker() {
        let panicking = queue(MockEngine::new().panicking_predict());
        let (first, _) = panicking.enqueue(request("a")).unwrap();
        let (second, _) = panicking.enqueue(request("b")).unwrap();
        for id in [first, second] {
            let view = panicking.wait(id, TIMEOUT).unwrap();
            assert_eq!(view.status, JobStatus::Failed);
            assert!(view.error.unwrap().contains("panicked"));
        }

        let failing = queue(MockEngine::new().failing_predict("device lost"));
        let (id, _) = failing.enqueue(request("c")).unwrap();
        let view = failing.wait(id, TIMEOUT).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("inference: device lost"));
    }

    #[test]
    fn finished_jobs_are_retained_up_to_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.queue.max_finished_jobs = 2;
        let queue = JobQueue::start(config, EngineHandle::ready(MockEngine::new())).unwrap();

        let written = GenerationRequest {
            output_path: Some(dir.path().join("a.wav")),
            ..request("a")
        };
        let (a, _) = queue.enqueue(written).unwrap();
        let (b, _) = queue.enqueue(request("b")).unwrap();
        let view = queue.wait(a, TIMEOUT).unwrap();
        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.written, [dir.path().join("a.wav")]);
        assert!(view.provenance.is_some());
        assert!(queue.output(a).is_none());

        assert_eq!(queue.wait(b, TIMEOUT).unwrap().status, JobStatus::Succeeded);
        assert!(queue.take_output(b).is_some());
        assert!(queue.output(b).is_none());
        assert!(queue.status(b).unwrap().provenance.is_some());

        let (c, _) = queue.enqueue(request("c")).unwrap();
        assert_eq!(queue.wait(c, TIMEOUT).unwrap().status, JobStatus::Succeeded);
        assert!(queue.status(a).is_none());
        let ids: Vec<JobId> = queue.list().iter().map(|view| view.id).collect();
        assert_eq!(ids, [b, c]);
    }

    #[test]
    fn wait_returns_at_the_deadline_for_a_running_job() {
        let gate = Gate::closed();
        let queue = queue(MockEngine::new().with_gate(gate.clone()));
        let (id, _) = queue.enqueue(request("held")).unwrap();
        wait_running(&queue, id);
        let started = Instant::now();
        let view = queue.wait(id, Duration::from_millis(50)).unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert!(started.elapsed() >= Duration::from_millis(50));
        gate.open();
        assert_eq!(queue.wait(id, TIMEOUT).unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn invalid_requests_are_rejected_at_enqueue() {
        let queue = queue(MockEngine::new());
        let empty = GenerationRequest::text_to_music("  ", 4.0, 3);
        assert!(matches!(queue.enqueue(empty), Err(Error::Validation(_))));
        let no_steps = GenerationRequest::text_to_music("x", 4.0, 0);
        assert!(matches!(queue.enqueue(no_steps), Err(Error::Validation(_))));
        assert!(queue.list().is_empty());
    }

    #[test]
    fn failed_lazy_load_is_retried_by_the_next_job() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let engine = EngineHandle::lazy(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Inference("weights missing".into()))
            } else {
                Ok(Box::new(MockEngine::new()) as Box<dyn crate::engine::InferenceEngine>)
            }
        });
        let queue = JobQueue::start(small_config(), engine).unwrap();
        let (first, _) = queue.enqueue(request("a")).unwrap();
        let (second, _) = queue.enqueue(request("b")).unwrap();

        let view = queue.wait(first, TIMEOUT).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("inference: weights missing"));
        assert_eq!(queue.wait(second, TIMEOUT).unwrap().status, JobStatus::Succeeded);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shutdown_drains_queue_and_closes_intake() {
        let queue = queue(MockEngine::new());
        let (a, _) = queue.enqueue(request("a")).unwrap();
        let (b, _) = queue.enqueue(request("b")).unwrap();
        queue.shutdown();
        assert_eq!(queue.status(a).unwrap().status, JobStatus::Succeeded);
        assert_eq!(queue.status(b).unwrap().status, JobStatus::Succeeded);
        assert!(matches!(queue.enqueue(request("c")), Err(Error::Manager(_))));
    }

    #[test]
    fn unknown_job() {
        let queue = queue(MockEngine::new());
        let id = JobId::new();
        assert!(queue.status(id).is_none());
        assert!(queue.wait(id, Duration::from_millis(1)).is_none());
        assert_eq!(queue.cancel(id).kind, CancelKind::NotFound);
    }
}
