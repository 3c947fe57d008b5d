//! # evsync Scheduler
//!
//! Background scheduling of sync engine runs.
//!
//! This crate provides:
//! - A periodic job per stream, keyed by the stream's text form
//! - Interval selection from foreground state and the OS standby bucket
//! - Exponential backoff after retryable failures
//! - Mapping of engine results to `Success`, `Retry` or `Failure`
//! - Bulk cancellation by user, stream kind or tag
//!
//! ## Architecture
//!
//! ```text
//! SyncScheduler ── job per stream ──▶ SyncWorker::do_work
//!       │                                  │
//!       ▼                                  ▼
//! PowerStateProvider              EngineRegistry ─▶ SyncEngine::process
//! ```
//!
//! ## Key Invariants
//!
//! - At most one job per stream; enqueuing again replaces the job, and the
//!   replacement runs only after the old job's run has been dropped
//! - A run skipped because the engine was busy is retried
//! - Backoff applies only after a run reported `Retry`
//! - Cancellation is never retried
//! - Host power state is only read through `PowerStateProvider`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod outcome;
mod power;
mod scheduler;
mod worker;

pub use backoff::BackoffPolicy;
pub use config::{JobConstraints, SchedulerConfig, StandbyIntervals};
pub use outcome::JobOutcome;
pub use power::{PowerStateProvider, StandbyBucket, StaticPowerState};
pub use scheduler::{JobState, JobStatus, SyncScheduler};
pub use worker::{EngineWorker, SyncWorker};
