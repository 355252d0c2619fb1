//! Unix-socket front end for a [`JobQueue`], line-delimited JSON.
//!
//! Each connection sends one JSON command line and receives one or more JSON
//! response lines, then closes.
//!
//! # Protocol
//!
//! **Commands**:
//! ```json
//! {"op": "enqueue", "request": {"caption": "upbeat jazz", "duration_s": 30}}
//! {"op": "status", "job_id": "7d0c…"}
//! {"op": "cancel", "job_id": "7d0c…"}
//! {"op": "watch", "job_id": "7d0c…"}
//! {"op": "list"}
//! ```
//!
//! **Responses** carry `"ok"`:
//! ```json
//! {"ok": true, "job_id": "7d0c…", "position": 2}
//! {"ok": true, "job": {"id": "7d0c…", "status": "running", ...}}
//! {"ok": false, "error": "invalid request: caption must not be empty"}
//! ```
//!
//! `watch` streams `{"ok": true, "event": {...}}` lines and finishes with the
//! job's final `{"ok": true, "job": {...}}` line.
//!
//! # Example (shell)
//!
//! ```sh
//! echo '{"op":"enqueue","request":{"caption":"ambient piano","duration_s":20}}' \
//!   | socat - UNIX-CONNECT:/tmp/ace-step-gen.sock
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::job::{CancelOutcome, JobId, JobView, ProgressEvent};
use crate::manager::JobQueue;
use crate::request::GenerationRequest;

/// Default socket path.
pub const DEFAULT_SOCKET: &str = "/tmp/ace-step-gen.sock";

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Enqueue { request: Box<GenerationRequest> },
    Status { job_id: JobId },
    Cancel { job_id: JobId },
    Watch { job_id: JobId },
    List,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Queued {
        ok: bool,
        job_id: JobId,
        position: usize,
    },
    Job {
        ok: bool,
        job: Box<JobView>,
    },
    Jobs {
        ok: bool,
        jobs: Vec<JobView>,
    },
    Cancel {
        ok: bool,
        #[serde(flatten)]
        outcome: CancelOutcome,
    },
    Event {
        ok: bool,
        event: ProgressEvent,
    },
    Err {
        ok: bool,
        error: String,
    },
}

impl Response {
    fn job(view: JobView) -> Self {
        Self::Job {
            ok: true,
            job: Box::new(view),
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: msg.into(),
        }
    }
}

/// Bind `path`, removing a stale socket file first.
pub fn bind(path: impl AsRef<Path>) -> Result<UnixListener> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!(socket = %path.display(), "listening");
    Ok(listener)
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: UnixListener, queue: Arc<JobQueue>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, queue).await {
                        tracing::warn!(%error, "connection error");
                    }
                });
            }
            Err(error) => tracing::error!(%error, "accept error"),
        }
    }
}

async fn handle_connection(stream: UnixStream, queue: Arc<JobQueue>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let line = match lines.next_line().await? {
        Some(line) if !line.trim().is_empty() => line,
        _ => return send(&mut writer, &Response::err("empty request")).await,
    };
    let command: Command = match serde_json::from_str(&line) {
        Ok(command) => command,
        Err(e) => return send(&mut writer, &Response::err(format!("invalid JSON command: {e}"))).await,
    };
    tracing::debug!(?command, "command");

    let response = match command {
        Command::Enqueue { request } => match queue.enqueue(*request) {
            Ok((job_id, position)) => Response::Queued {
                ok: true,
                job_id,
                position,
            },
            Err(e) => Response::err(e.to_string()),
        },
        Command::Status { job_id } => match queue.status(job_id) {
            Some(view) => Response::job(view),
            None => Response::err(format!("job {job_id} not found")),
        },
        Command::Cancel { job_id } => {
            let outcome = queue.cancel(job_id);
            Response::Cancel {
                ok: outcome.accepted,
                outcome,
            }
        }
        Command::List => Response::Jobs {
            ok: true,
            jobs: queue.list(),
        },
        Command::Watch { job_id } => return watch(&mut writer, &queue, job_id).await,
    };
    send(&mut writer, &response).await
}

/// Stream progress events for one job until it is terminal.
async fn watch(writer: &mut OwnedWriteHalf, queue: &JobQueue, job_id: JobId) -> Result<()> {
    // Subscribe before reading the status so no transition is missed.
    let mut events = queue.subscribe();
    match queue.status(job_id) {
        None => return send(writer, &Response::err(format!("job {job_id} not found"))).await,
        Some(view) if view.status.is_terminal() => return send(writer, &Response::job(view)).await,
        Some(_) => {}
    }

    loop {
        match events.recv().await {
            Ok(event) if event.job_id == job_id => {
                let done = event.status.is_terminal();
                send(writer, &Response::Event { ok: true, event }).await?;
                if done {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(job.id = %job_id, skipped, "watcher lagged");
                if queue.status(job_id).is_some_and(|view| view.status.is_terminal()) {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    match queue.status(job_id) {
        Some(view) => send(writer, &Response::job(view)).await,
        None => Ok(()),
    }
}

async fn send(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}
