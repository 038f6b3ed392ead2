//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited. The parent writes
//! [`ParentMessage`]s to the worker's stdin; the worker answers with
//! [`WorkerMessage`]s on its stdout.
//!
//! ```text
//!   parent                          worker
//!     │  <──────────── Ready           │  (unprompted, runtime is up)
//!     │  Init ────────────────────>    │
//!     │  <──────── Initialized / InitError
//!     │  Call{id} ────────────────>    │
//!     │  <──────── Result{id} / Rejection{id}
//!     │  Dispose ─────────────────>    │
//!     │  <──────── DisposeCompleted    │
//! ```
//!
//! `Log` messages may arrive at any point after `Ready`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{ErrorValue, Value};

/// Message from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Construct the subject inside the worker.
    Init {
        /// Registered plugin name, e.g. `"fixture-test-runner"`.
        plugin: String,
        /// Plugin-specific options.
        options: Value,
        /// Working directory to switch into before constructing the subject.
        #[serde(default)]
        working_dir: Option<String>,
        /// Minimum level of log records the worker should forward.
        log_level: String,
    },

    /// Invoke a method on the subject.
    Call {
        correlation_id: u64,
        method: String,
        args: Vec<Value>,
    },

    /// Release the subject and exit.
    Dispose,
}

/// Message from worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker runtime is up and waiting for `Init`.
    Ready,

    Initialized,

    InitError { error: ErrorValue },

    Result { correlation_id: u64, result: Value },

    Rejection {
        correlation_id: u64,
        error: ErrorValue,
    },

    DisposeCompleted,

    Log { record: LogRecord },
}

/// Structured log record forwarded from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub category: String,
    pub message: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
}

impl ParentMessage {
    /// Create a call message.
    pub fn call(correlation_id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            correlation_id,
            method: method.into(),
            args,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerMessage {
    /// Create a rejection for a call.
    pub fn rejection(correlation_id: u64, error: ErrorValue) -> Self {
        Self::Rejection {
            correlation_id,
            error,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
