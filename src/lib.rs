//! A distributed, database-coordinated job scheduler.
//!
//! Multiple controller processes share one relational database and
//! cooperate to run periodically-scheduled background jobs — credential
//! lease renewal, token rotation, cleanup tasks — at most once per job at
//! any instant across the fleet. This crate is the scheduler's runtime on a
//! single controller plus the database-level coordination protocol that
//! makes running it concurrently across controllers safe:
//!
//! - [`job`] — the handler contract ([`Job`]) and the row types
//!   ([`JobRecord`], [`JobRun`]) a [`persistence::Persistence`]
//!   implementation reads and writes.
//! - [`persistence`] — the persistence contract the scheduler consumes, a
//!   Postgres-backed implementation behind the `postgres` feature, and an
//!   in-memory double for tests behind `testing`.
//! - [`scheduler`] — [`Scheduler`], the façade embedders construct: register
//!   jobs against it, then [`Scheduler::start`] to launch the run loop and
//!   monitor loop.
//! - [`error`] — [`SchedulerError`], the pattern-matchable error type every
//!   public entry point returns.
//!
//! Coordination across controllers is exclusively through the database: no
//! in-process queueing, no fairness guarantees across jobs, no sub-second
//! scheduling precision, and no exactly-once side-effect semantics inside
//! handlers (handlers must be idempotent). See each module's docs for the
//! full contract.

pub mod error;
pub mod job;
mod monitor;
pub mod persistence;
mod registry;
mod scheduler;
mod worker;

pub use error::{Result, SchedulerError};
pub use job::{Job, JobRecord, JobRun, JobStatus, RunOutcome, RunStatus};
pub use persistence::Persistence;
pub use scheduler::{Scheduler, SchedulerOptions};
