//! Error types for ace-step-engine.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Message recorded on jobs that stopped because a caller cancelled them.
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor error raised by the sampler's own tensor arithmetic.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// The request was rejected before it reached the queue.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Cooperative cancellation was observed between sampler steps.
    ///
    /// This is not a failure: the job queue records it as `cancelled`.
    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,

    /// Adapter identity could not be resolved or attached.
    #[error("adapter: {0}")]
    Adapter(String),

    /// Error raised by the inference engine capability.
    #[error("inference: {0}")]
    Inference(String),

    /// Audio processing error (WAV I/O, bad handle).
    #[error("audio: {0}")]
    Audio(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// HuggingFace Hub error.
    #[error("hf-hub: {0}")]
    HfHub(String),

    /// Job queue error (shut down, worker gone, unknown job).
    #[error("manager: {0}")]
    Manager(String),
}

impl Error {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(error: hf_hub::api::sync::ApiError) -> Self {
        Error::HfHub(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_displays_fixed_message() {
        assert_eq!(Error::Cancelled.to_string(), "cancelled by user");
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Inference("boom".into()).is_cancelled());
    }
}
