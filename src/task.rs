//! Task resolution.
//!
//! Callers send a free-form task name plus whatever audio they have. The
//! resolver turns that into one of a fixed set of tasks and decides which
//! audio handle, if any, the sampler anchors to. It never fails: a task that
//! needs audio but has none degrades to plain text-to-music.

use serde::Serialize;

use crate::request::{AudioHandle, GenerationRequest};

/// Normalized generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextToMusic,
    Retake,
    Repaint,
    Extend,
    Edit,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TextToMusic => "text_to_music",
            TaskKind::Retake => "retake",
            TaskKind::Repaint => "repaint",
            TaskKind::Extend => "extend",
            TaskKind::Edit => "edit",
        }
    }

    /// Tasks that regenerate (part of) an existing buffer and imply audio-to-audio.
    pub fn needs_reference(&self) -> bool {
        matches!(self, TaskKind::Retake | TaskKind::Repaint | TaskKind::Extend)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every accepted spelling, after normalization.
const TASK_NAMES: &[(&str, TaskKind)] = &[
    ("text_to_music", TaskKind::TextToMusic),
    ("text2music", TaskKind::TextToMusic),
    ("retake", TaskKind::Retake),
    ("cover", TaskKind::Retake),
    ("audio_to_audio", TaskKind::Retake),
    ("repaint", TaskKind::Repaint),
    ("extend", TaskKind::Extend),
    ("edit", TaskKind::Edit),
];

/// Look up a raw task name. Case, surrounding whitespace, `-` and inner
/// spaces are not significant.
pub fn parse_task(raw: &str) -> Option<TaskKind> {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    TASK_NAMES
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|&(_, kind)| kind)
}

/// Which of the request's handles the sampler should treat as its reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceRole {
    Reference,
    Source,
}

/// Outcome of task resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedTask {
    pub task: TaskKind,
    pub audio_to_audio: bool,
    pub reference: Option<ReferenceRole>,
}

impl ResolvedTask {
    /// The handle selected by [`ResolvedTask::reference`].
    pub fn reference_handle<'a>(&self, request: &'a GenerationRequest) -> Option<&'a AudioHandle> {
        match self.reference? {
            ReferenceRole::Reference => request.reference_audio.as_ref(),
            ReferenceRole::Source => request.source_audio.as_ref(),
        }
    }
}

/// Resolve a raw task name, the audio-to-audio flag and the available audio.
pub fn resolve(
    task: &str,
    audio_to_audio: bool,
    reference: Option<&AudioHandle>,
    source: Option<&AudioHandle>,
) -> ResolvedTask {
    let parsed = parse_task(task);
    if parsed.is_none() && !task.trim().is_empty() {
        tracing::debug!(task, "unknown task name, using text_to_music");
    }
    let mut kind = parsed.unwrap_or(TaskKind::TextToMusic);

    if kind == TaskKind::Edit {
        // Edit transforms its source; the reference only stands in for it.
        let role = match (source, reference) {
            (Some(_), _) => Some(ReferenceRole::Source),
            (None, Some(_)) => Some(ReferenceRole::Reference),
            (None, None) => None,
        };
        return ResolvedTask {
            task: kind,
            audio_to_audio: false,
            reference: role,
        };
    }

    if audio_to_audio && kind == TaskKind::TextToMusic {
        kind = TaskKind::Retake;
    }

    let role = match (reference, source) {
        (Some(_), _) => Some(ReferenceRole::Reference),
        (None, Some(_)) => Some(ReferenceRole::Source),
        (None, None) => None,
    };

    if kind.needs_reference() && role.is_none() {
        tracing::warn!(
            task = %kind,
            "no reference or source audio, falling back to text_to_music"
        );
        return ResolvedTask {
            task: TaskKind::TextToMusic,
            audio_to_audio: false,
            reference: None,
        };
    }

    let audio_to_audio = kind.needs_reference();
    ResolvedTask {
        task: kind,
        audio_to_audio,
        // Plain text-to-music never reads the reference.
        reference: if audio_to_audio { role } else { None },
    }
}

/// [`resolve`] applied to a request's own fields.
pub fn resolve_request(request: &GenerationRequest) -> ResolvedTask {
    resolve(
        &request.task,
        request.audio_to_audio,
        request.reference_audio.as_ref(),
        request.source_audio.as_ref(),
    )
}
