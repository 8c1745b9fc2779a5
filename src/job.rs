//! The job definition contract and the row types persistence implementations
//! read and write.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A progress snapshot a handler reports for its currently running job.
///
/// `completed > total` is not a representable state in the database; the
/// monitor treats such a snapshot as invalid and discards it for that tick
/// rather than persisting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobStatus {
    pub total: u64,
    pub completed: u64,
}

impl JobStatus {
    pub fn new(total: u64, completed: u64) -> Self {
        Self { total, completed }
    }

    /// `true` iff this snapshot is safe to persist.
    pub fn is_valid(&self) -> bool {
        self.completed <= self.total
    }
}

/// The handler contract a registered unit of work must satisfy.
///
/// Implementors are shared across the run loop, the worker pool, and the
/// monitor as `Arc<dyn Job>`, so `name`/`description`/`next_run_in` must be
/// cheap and side-effect free. `status` is polled once per monitor tick per
/// live run and must not block indefinitely — see the crate-level docs for
/// the asynchronous-snapshot guidance.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stable, process-unique, globally-shared identifier.
    fn name(&self) -> &str;

    /// Free-text description, stored alongside the job row.
    fn description(&self) -> &str;

    /// How long after this run ends before the job becomes eligible again.
    fn next_run_in(&self) -> chrono::Duration;

    /// Run the job to completion or failure, honoring `cancel`.
    ///
    /// Implementations must observe `cancel` in any loop or suspension
    /// point they control; the scheduler has no other way to influence an
    /// in-flight run short of the controller dying.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Non-blocking progress snapshot, polled by the monitor. The default
    /// reports no progress, which is always valid.
    fn status(&self) -> JobStatus {
        JobStatus::default()
    }
}

/// The current lifecycle state of a [`JobRun`].
///
/// All variants other than `Running` are terminal; a terminal run is never
/// resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(
    feature = "postgres",
    derive(sqlx::Type),
    sqlx(type_name = "job_run_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    /// `true` for any of the three states a run does not leave once entered.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// The persisted scheduling row for one registered job name.
///
/// Identity is `name`; exactly one `JobRecord` exists per name across the
/// fleet regardless of how many controllers have the job registered
/// in-process.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct JobRecord {
    pub name: String,
    pub description: String,
    pub next_scheduled_run: DateTime<Utc>,
}

/// One execution attempt of a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_name: String,
    pub controller_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_count: i64,
    pub completed_count: i64,
}

impl JobRun {
    /// Construct a freshly-claimed run in the `Running` state.
    pub fn claimed(job_name: impl Into<String>, controller_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.into(),
            controller_id: controller_id.into(),
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            ended_at: None,
            total_count: 0,
            completed_count: 0,
        }
    }
}

/// The terminal outcome a worker reports for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed => RunStatus::Failed,
        }
    }
}
