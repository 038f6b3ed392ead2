//! stryx - worker-pool core for mutation testing.
//!
//! Runs a project's test suite against mutated sources inside a bounded pool
//! of isolated worker processes, and turns each run into a per-mutant verdict.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────┐      ┌──────────────────┐
//!   │ ConcurrencyToken-    │─────▶│  ResourcePool<T> │
//!   │ Provider             │      │  (checkout/in)   │
//!   └──────────────────────┘      └────────┬─────────┘
//!                                          │ borrow
//!   ┌──────────────────────┐      ┌────────▼─────────┐      ┌───────────────┐
//!   │ MutationTestExecutor │─────▶│  WorkerProxy     │─────▶│ worker process│
//!   │ (plan, run, verdict) │      │  (call protocol) │◀─────│ (subject)     │
//!   └──────────┬───────────┘      └──────────────────┘      └───────────────┘
//!              │ lookup
//!   ┌──────────▼───────────┐
//!   │ TestCoverage         │
//!   └──────────────────────┘
//! ```

pub mod concurrency;
pub mod config;
pub mod coverage;
pub mod error;
pub mod execution;
pub mod logging;
pub mod memory;
pub mod mutant;
pub mod output;
pub mod pool;
pub mod progress;
pub mod runner;
pub mod theme;
pub mod worker;

pub use config::{CoverageAnalysis, StryxOptions, WorkerPlugin};
pub use error::{Result, StryxError};
pub use execution::run_mutation_test;
pub use mutant::{Mutant, MutantResult, MutantStatus};
