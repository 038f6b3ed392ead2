//! Error types for stryx.

use std::time::Duration;

use thiserror::Error;

use crate::worker::signals::CrashDetails;
use crate::worker::value::ErrorValue;

/// Main error type for stryx.
#[derive(Error, Debug)]
pub enum StryxError {
    /// Invalid user configuration. Fatal, reported without a cause chain.
    #[error("{0}")]
    Config(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker failed its handshake or its subject could not be constructed.
    #[error("Worker failed to initialize: {message}")]
    Init { message: String },

    #[error("{0}")]
    Crashed(CrashDetails),

    #[error("{0}")]
    OutOfMemory(CrashDetails),

    #[error("Call '{method}' timed out after {}ms", timeout.as_millis())]
    CallTimeout { method: String, timeout: Duration },

    /// The worker-side subject threw while handling a call.
    #[error("Worker rejected call '{method}': {error}")]
    Rejection { method: String, error: ErrorValue },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker has been disposed")]
    Disposed,

    #[error("Resource pool has been disposed")]
    PoolDisposed,

    #[error("Dry run failed: {0}")]
    DryRun(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StryxError {
    /// The worker that produced this error can no longer be trusted and must not
    /// go back to the pool.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            Self::Crashed(_)
                | Self::OutOfMemory(_)
                | Self::CallTimeout { .. }
                | Self::Protocol(_)
                | Self::Disposed
        )
    }

    /// A systemic setup problem (spawn or handshake), not tied to one mutant.
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, Self::Spawn(_) | Self::Init { .. } | Self::Config(_))
    }
}

impl From<CrashDetails> for StryxError {
    fn from(details: CrashDetails) -> Self {
        if details.is_out_of_memory() {
            Self::OutOfMemory(details)
        } else {
            Self::Crashed(details)
        }
    }
}

/// Result type alias for stryx operations.
pub type Result<T> = std::result::Result<T, StryxError>;
