//! Worker processes hosting test runners and checkers.
//!
//! Every test runner and checker lives in its own child process, an instance
//! of the current executable started in the hidden `worker` mode. The parent
//! talks to it through a [`WorkerProxy`] over newline-delimited JSON on the
//! child's stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │  (WorkerProxy)  │
//!                     └────────┬────────┘
//!                              │ stdin/stdout
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ Subject   │  │ Subject   │  │ Subject   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: A crashing or leaking subject takes down only its worker
//! - **Crash diagnostics**: Exit status plus the last lines of stdout/stderr
//! - **Memory watchdog**: Workers over their RSS budget are killed and reported as OOM
//! - **Call timeouts**: A hung call taints its worker so it is never reused

pub mod ipc;
pub mod protocol;
pub mod proxy;
pub mod signals;
pub mod spawn;
pub mod subject;
pub mod value;
pub mod watchdog;
pub mod worker_main;

pub use proxy::WorkerProxy;
pub use signals::{CrashDetails, TerminationReason};
pub use spawn::WorkerOptions;
pub use value::{ErrorValue, Value};
pub use watchdog::MemoryWatchdog;
pub use worker_main::run_worker_main;
