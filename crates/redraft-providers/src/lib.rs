pub mod client;
pub mod retry;

pub use client::{BackendConfig, OllamaBackend, DEFAULT_ENDPOINT, DEFAULT_MODEL};
pub use retry::{classify_status, RetryPolicy};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Failure taxonomy for one generation attempt. `Transient`, `RateLimited`
/// and `Server` are retryable under [`RetryPolicy`]; `Fatal` surfaces
/// immediately.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerateError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("generation endpoint rate limited the request")]
    RateLimited { retry_after: Option<f64> },
    #[error("generation endpoint returned server error {status}")]
    Server {
        status: u16,
        retry_after: Option<f64>,
    },
    #[error("request failed: {0}")]
    Fatal(String),
}

impl GenerateError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerateError::Transient(_)
                | GenerateError::RateLimited { .. }
                | GenerateError::Server { .. }
        )
    }

    /// Numeric Retry-After carried by the failed response, if any.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            GenerateError::RateLimited { retry_after }
            | GenerateError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Terminal state of one streaming task. Exactly one of these follows the
/// chunk sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Ok,
    Error(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Chunk(String),
    Finished(TaskOutcome),
}

/// Handle to one in-flight streaming task: an ordered event stream (zero or
/// more chunks, then exactly one `Finished`) plus a cancellation trigger.
pub struct TaskHandle {
    events: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Assemble a handle from its channel halves. Alternate backends (and
    /// test doubles) use this; `OllamaBackend` wires it up internally.
    pub fn from_parts(events: mpsc::Receiver<WorkerEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Request cooperative cancellation. Safe to call from any task at any
    /// time; a no-op once the worker has already finished.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Seam between the orchestrator and the streaming worker. `start` returns
/// immediately; the attempt runs on its own tokio task so network I/O never
/// blocks the caller.
pub trait GenerationBackend: Send + Sync {
    fn start(&self, prompt: String) -> TaskHandle;
}
