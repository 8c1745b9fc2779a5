//! The persistence contract the scheduler consumes, plus a Postgres-backed
//! implementation and an in-memory double for tests.
//!
//! The scheduler core only ever depends on [`Persistence`]; everything in
//! this module below the trait is a concrete collaborator, not part of the
//! scheduling algorithm itself.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use async_trait::async_trait;

use crate::error::{Result, SchedulerError};
use crate::job::{JobRecord, JobRun, RunOutcome};

/// The durable operations the scheduler requires of its backing store.
///
/// Implementations must be safe to share across the run loop, every worker,
/// and the monitor loop concurrently (`Arc<dyn Persistence>`).
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Idempotent create/update of a job row keyed on `name`.
    async fn upsert_job(&self, name: &str, description: &str, next_run: DateTime<Utc>) -> Result<()>;

    /// Set `next_scheduled_run = t`; errors with [`SchedulerError::NotFound`]
    /// if no row named `name` exists.
    async fn update_job_next_run(&self, name: &str, t: DateTime<Utc>) -> Result<()>;

    /// Atomically claim up to `limit` due jobs with no live run, returning
    /// only the runs this call actually created.
    async fn claim_runs(&self, controller_id: &str, limit: usize) -> Result<Vec<JobRun>>;

    /// Persist a progress snapshot; a no-op if the run is already terminal.
    async fn update_run_progress(
        &self,
        run_id: Uuid,
        total: u64,
        completed: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Transition a run to a terminal state and stamp `ended_at`.
    async fn complete_run(&self, run_id: Uuid, outcome: RunOutcome, ended_at: DateTime<Utc>) -> Result<()>;

    /// Read the current row for a run.
    async fn lookup_run(&self, run_id: Uuid) -> Result<JobRun>;

    /// Transition every `running` run whose owning controller's heartbeat is
    /// older than `liveness_window` into `interrupted`.
    async fn reap_dead_runs(&self, now: DateTime<Utc>, liveness_window: Duration) -> Result<u64>;

    /// Fetch a single job row, used by the registry to surface
    /// [`SchedulerError::NotFound`] without duplicating lookup logic.
    async fn lookup_job(&self, name: &str) -> Result<Option<JobRecord>>;
}

#[cfg(feature = "postgres")]
pub mod postgres {
    //! A Postgres-backed [`Persistence`] implementation.
    //!
    //! The claim query is a single `FOR UPDATE SKIP LOCKED` candidate
    //! selection feeding an `UPDATE ... RETURNING`-shaped insert, so
    //! concurrent claimers never block each other and never double-claim a
    //! job name. Controller liveness is read from a `controllers` table the
    //! embedder owns; this module only ever reads `last_heartbeat_at` from
    //! it.

    use super::*;
    use sqlx::PgPool;

    pub struct PostgresPersistence {
        pool: PgPool,
    }

    impl PostgresPersistence {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl Persistence for PostgresPersistence {
        async fn upsert_job(&self, name: &str, description: &str, next_run: DateTime<Utc>) -> Result<()> {
            sqlx::query(
                r#"
                INSERT INTO scheduler_jobs (name, description, next_scheduled_run)
                VALUES ($1, $2, $3)
                ON CONFLICT (name) DO UPDATE
                SET description = EXCLUDED.description
                "#,
            )
            .bind(name)
            .bind(description)
            .bind(next_run)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::transient)?;
            Ok(())
        }

        async fn update_job_next_run(&self, name: &str, t: DateTime<Utc>) -> Result<()> {
            let result = sqlx::query(
                r#"
                UPDATE scheduler_jobs
                SET next_scheduled_run = $1
                WHERE name = $2
                "#,
            )
            .bind(t)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::transient)?;

            if result.rows_affected() == 0 {
                return Err(SchedulerError::NotFound { name: name.to_string() });
            }
            Ok(())
        }

        async fn claim_runs(&self, controller_id: &str, limit: usize) -> Result<Vec<JobRun>> {
            let rows = sqlx::query_as::<_, JobRun>(
                r#"
                WITH due AS (
                    SELECT j.name
                    FROM scheduler_jobs j
                    WHERE j.next_scheduled_run <= NOW()
                      AND NOT EXISTS (
                          SELECT 1 FROM scheduler_job_runs r
                          WHERE r.job_name = j.name AND r.status = 'running'
                      )
                    ORDER BY j.next_scheduled_run
                    LIMIT $1
                    FOR UPDATE OF j SKIP LOCKED
                )
                INSERT INTO scheduler_job_runs
                    (run_id, job_name, controller_id, status, started_at, updated_at, total_count, completed_count)
                SELECT gen_random_uuid(), due.name, $2, 'running', NOW(), NOW(), 0, 0
                FROM due
                RETURNING run_id, job_name, controller_id, status, started_at, updated_at, ended_at, total_count, completed_count
                "#,
            )
            .bind(limit as i64)
            .bind(controller_id)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::transient)?;

            Ok(rows)
        }

        async fn update_run_progress(
            &self,
            run_id: Uuid,
            total: u64,
            completed: u64,
            updated_at: DateTime<Utc>,
        ) -> Result<()> {
            sqlx::query(
                r#"
                UPDATE scheduler_job_runs
                SET total_count = $1, completed_count = $2, updated_at = $3
                WHERE run_id = $4 AND status = 'running'
                "#,
            )
            .bind(total as i64)
            .bind(completed as i64)
            .bind(updated_at)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::transient)?;
            Ok(())
        }

        async fn complete_run(&self, run_id: Uuid, outcome: RunOutcome, ended_at: DateTime<Utc>) -> Result<()> {
            let status = crate::job::RunStatus::from(outcome);
            sqlx::query(
                r#"
                UPDATE scheduler_job_runs
                SET status = $1, ended_at = $2, updated_at = $2
                WHERE run_id = $3 AND status = 'running'
                "#,
            )
            .bind(status)
            .bind(ended_at)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::transient)?;
            Ok(())
        }

        async fn lookup_run(&self, run_id: Uuid) -> Result<JobRun> {
            sqlx::query_as::<_, JobRun>(
                r#"
                SELECT run_id, job_name, controller_id, status, started_at, updated_at, ended_at, total_count, completed_count
                FROM scheduler_job_runs
                WHERE run_id = $1
                "#,
            )
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::transient)
        }

        async fn reap_dead_runs(&self, now: DateTime<Utc>, liveness_window: Duration) -> Result<u64> {
            let threshold = now - liveness_window;
            let result = sqlx::query(
                r#"
                UPDATE scheduler_job_runs r
                SET status = 'interrupted', ended_at = $1, updated_at = $1
                WHERE r.status = 'running'
                  AND EXISTS (
                      SELECT 1 FROM controllers c
                      WHERE c.controller_id = r.controller_id
                        AND c.last_heartbeat_at < $2
                  )
                "#,
            )
            .bind(now)
            .bind(threshold)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::transient)?;
            Ok(result.rows_affected())
        }

        async fn lookup_job(&self, name: &str) -> Result<Option<JobRecord>> {
            sqlx::query_as::<_, JobRecord>(
                r#"
                SELECT name, description, next_scheduled_run
                FROM scheduler_jobs
                WHERE name = $1
                "#,
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::transient)
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! An in-memory [`Persistence`] double, sufficient to exercise every
    //! invariant in-process without a live database, plus a
    //! rendezvous-shaped test [`Job`](crate::job::Job) for deterministically
    //! exercising monitor timing. Shipped behind the `testing` feature for
    //! embedders; always available to this crate's own test suite.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::RwLock;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use crate::job::{Job, JobStatus};

    #[derive(Debug, Clone)]
    struct ControllerHeartbeat {
        last_heartbeat_at: DateTime<Utc>,
    }

    #[derive(Default)]
    struct Inner {
        jobs: HashMap<String, JobRecord>,
        runs: HashMap<Uuid, JobRun>,
        heartbeats: HashMap<String, ControllerHeartbeat>,
    }

    /// In-memory store backing the crate's own test suite and available to
    /// embedders under the `testing` feature.
    pub struct InMemoryPersistence {
        inner: Mutex<Inner>,
    }

    impl InMemoryPersistence {
        pub fn new() -> Self {
            Self {
                inner: Mutex::new(Inner::default()),
            }
        }

        /// Record (or refresh) a controller's heartbeat, consumed by
        /// [`Persistence::reap_dead_runs`]. Test-only surface; production
        /// heartbeats live in the embedder's own controller table.
        pub fn heartbeat(&self, controller_id: &str, at: DateTime<Utc>) {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.heartbeats.insert(
                controller_id.to_string(),
                ControllerHeartbeat { last_heartbeat_at: at },
            );
        }

        /// Snapshot a run for assertions in tests.
        pub fn run(&self, run_id: Uuid) -> Option<JobRun> {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.runs.get(&run_id).cloned()
        }

        /// The current `running` run for `job_name`, if any. Useful in tests
        /// that drive a [`Scheduler`](crate::Scheduler) and need to find the
        /// run it claimed without knowing its `run_id` ahead of time.
        pub async fn run_for_job(&self, job_name: &str) -> Result<Option<JobRun>> {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner
                .runs
                .values()
                .find(|r| r.job_name == job_name && r.status == crate::job::RunStatus::Running)
                .cloned())
        }

        /// Count of runs currently in the `running` state, across all jobs.
        pub fn running_count(&self) -> usize {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .runs
                .values()
                .filter(|r| r.status == crate::job::RunStatus::Running)
                .count()
        }

        /// Force `run_id` into `Interrupted`, simulating an operator setting
        /// `status = interrupted` directly on the row. Does not touch
        /// `ended_at`, matching the normative contract where only the
        /// monitor's own reap and the worker's post-run persistence stamp it.
        pub fn external_interrupt(&self, run_id: Uuid) {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = inner.runs.get_mut(&run_id) {
                run.status = crate::job::RunStatus::Interrupted;
            }
        }
    }

    /// A job whose `run` blocks until released and whose reported progress
    /// is settable from the outside — the rendezvous shape called for in
    /// the crate's own test suite so monitor ticks can be exercised without
    /// racing real time. Production jobs should prefer a plain
    /// non-blocking `status()` accessor instead of this pattern.
    pub struct RendezvousJob {
        name: String,
        status: RwLock<JobStatus>,
        release: Notify,
        started: Notify,
    }

    impl RendezvousJob {
        pub fn new(name: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                status: RwLock::new(JobStatus::default()),
                release: Notify::new(),
                started: Notify::new(),
            })
        }

        /// Update the snapshot the monitor will observe on its next poll.
        pub fn set_status(&self, status: JobStatus) {
            *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
        }

        /// Unblock a handshake currently parked in `run`.
        pub fn release(&self) {
            self.release.notify_one();
        }

        /// Resolve once `run` has been invoked at least once since this call
        /// was made, for tests that need to know a claim actually executed
        /// before asserting against it.
        pub async fn wait_until_started(&self) {
            self.started.notified().await;
        }
    }

    #[async_trait]
    impl Job for RendezvousJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "blocks until released, for deterministic monitor tests"
        }

        fn next_run_in(&self) -> chrono::Duration {
            chrono::Duration::hours(1)
        }

        async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
            self.started.notify_one();
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.release.notified() => {}
            }
            Ok(())
        }

        fn status(&self) -> JobStatus {
            *self.status.read().unwrap_or_else(|e| e.into_inner())
        }
    }

    impl Default for InMemoryPersistence {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Persistence for InMemoryPersistence {
        async fn upsert_job(&self, name: &str, description: &str, next_run: DateTime<Utc>) -> Result<()> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .jobs
                .entry(name.to_string())
                .and_modify(|j| j.description = description.to_string())
                .or_insert_with(|| JobRecord {
                    name: name.to_string(),
                    description: description.to_string(),
                    next_scheduled_run: next_run,
                });
            Ok(())
        }

        async fn update_job_next_run(&self, name: &str, t: DateTime<Utc>) -> Result<()> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.jobs.get_mut(name) {
                Some(job) => {
                    job.next_scheduled_run = t;
                    Ok(())
                }
                None => Err(SchedulerError::NotFound { name: name.to_string() }),
            }
        }

        async fn claim_runs(&self, controller_id: &str, limit: usize) -> Result<Vec<JobRun>> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();

            let mut due: Vec<String> = inner
                .jobs
                .values()
                .filter(|j| j.next_scheduled_run <= now)
                .filter(|j| {
                    !inner
                        .runs
                        .values()
                        .any(|r| r.job_name == j.name && r.status == crate::job::RunStatus::Running)
                })
                .map(|j| j.name.clone())
                .collect();
            due.sort_by_key(|name| inner.jobs[name].next_scheduled_run);
            due.truncate(limit);

            let mut claimed = Vec::with_capacity(due.len());
            for name in due {
                let run = JobRun::claimed(&name, controller_id, now);
                inner.runs.insert(run.run_id, run.clone());
                claimed.push(run);
            }
            Ok(claimed)
        }

        async fn update_run_progress(
            &self,
            run_id: Uuid,
            total: u64,
            completed: u64,
            updated_at: DateTime<Utc>,
        ) -> Result<()> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = inner.runs.get_mut(&run_id) {
                if run.status == crate::job::RunStatus::Running {
                    run.total_count = total as i64;
                    run.completed_count = completed as i64;
                    run.updated_at = updated_at;
                }
            }
            Ok(())
        }

        async fn complete_run(&self, run_id: Uuid, outcome: RunOutcome, ended_at: DateTime<Utc>) -> Result<()> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = inner.runs.get_mut(&run_id) {
                if run.status == crate::job::RunStatus::Running {
                    run.status = outcome.into();
                    run.ended_at = Some(ended_at);
                    run.updated_at = ended_at;
                }
            }
            Ok(())
        }

        async fn lookup_run(&self, run_id: Uuid) -> Result<JobRun> {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .runs
                .get(&run_id)
                .cloned()
                .ok_or_else(|| SchedulerError::NotFound { name: run_id.to_string() })
        }

        async fn reap_dead_runs(&self, now: DateTime<Utc>, liveness_window: Duration) -> Result<u64> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let threshold = now - liveness_window;

            let dead_controllers: Vec<String> = inner
                .heartbeats
                .iter()
                .filter(|(_, hb)| hb.last_heartbeat_at < threshold)
                .map(|(id, _)| id.clone())
                .collect();

            let mut reaped = 0u64;
            for run in inner.runs.values_mut() {
                if run.status == crate::job::RunStatus::Running && dead_controllers.contains(&run.controller_id) {
                    run.status = crate::job::RunStatus::Interrupted;
                    run.ended_at = Some(now);
                    run.updated_at = now;
                    reaped += 1;
                }
            }
            Ok(reaped)
        }

        async fn lookup_job(&self, name: &str) -> Result<Option<JobRecord>> {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner.jobs.get(name).cloned())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::Duration as ChronoDuration;

        #[tokio::test]
        async fn upsert_then_lookup_round_trips() {
            let store = InMemoryPersistence::new();
            let now = Utc::now();
            store.upsert_job("rotate-tokens", "rotates tokens", now).await.unwrap();
            let job = store.lookup_job("rotate-tokens").await.unwrap().unwrap();
            assert_eq!(job.name, "rotate-tokens");
            assert_eq!(job.description, "rotates tokens");
        }

        #[tokio::test]
        async fn update_next_run_errors_on_missing_job() {
            let store = InMemoryPersistence::new();
            let err = store.update_job_next_run("missing", Utc::now()).await.unwrap_err();
            assert!(matches!(err, SchedulerError::NotFound { .. }));
        }

        #[tokio::test]
        async fn claim_runs_respects_eligibility() {
            let store = InMemoryPersistence::new();
            let future = Utc::now() + ChronoDuration::hours(1);
            store.upsert_job("not-due-yet", "d", future).await.unwrap();

            let claimed = store.claim_runs("controller-a", 10).await.unwrap();
            assert!(claimed.is_empty());
        }

        #[tokio::test]
        async fn claim_runs_is_single_flight_per_job_name() {
            let store = InMemoryPersistence::new();
            let due = Utc::now() - ChronoDuration::seconds(1);
            store.upsert_job("rotate-tokens", "d", due).await.unwrap();

            let first = store.claim_runs("controller-a", 10).await.unwrap();
            let second = store.claim_runs("controller-b", 10).await.unwrap();

            assert_eq!(first.len(), 1);
            assert!(second.is_empty());
            assert_eq!(store.running_count(), 1);
        }

        #[tokio::test]
        async fn progress_is_discarded_once_terminal() {
            let store = InMemoryPersistence::new();
            let due = Utc::now() - ChronoDuration::seconds(1);
            store.upsert_job("rotate-tokens", "d", due).await.unwrap();
            let run = &store.claim_runs("controller-a", 10).await.unwrap()[0];

            store.complete_run(run.run_id, RunOutcome::Completed, Utc::now()).await.unwrap();
            store
                .update_run_progress(run.run_id, 10, 5, Utc::now())
                .await
                .unwrap();

            let persisted = store.lookup_run(run.run_id).await.unwrap();
            assert_eq!(persisted.total_count, 0);
            assert_eq!(persisted.completed_count, 0);
            assert_eq!(persisted.status, crate::job::RunStatus::Completed);
        }

        #[tokio::test]
        async fn reap_dead_runs_interrupts_orphaned_rows() {
            let store = InMemoryPersistence::new();
            let due = Utc::now() - ChronoDuration::seconds(1);
            store.upsert_job("rotate-tokens", "d", due).await.unwrap();
            let run = store.claim_runs("controller-a", 10).await.unwrap().remove(0);

            store.heartbeat("controller-a", Utc::now() - ChronoDuration::hours(1));

            let reaped = store
                .reap_dead_runs(Utc::now(), ChronoDuration::minutes(1))
                .await
                .unwrap();
            assert_eq!(reaped, 1);

            let persisted = store.lookup_run(run.run_id).await.unwrap();
            assert_eq!(persisted.status, crate::job::RunStatus::Interrupted);
        }

        #[tokio::test]
        async fn reap_leaves_live_controllers_alone() {
            let store = InMemoryPersistence::new();
            let due = Utc::now() - ChronoDuration::seconds(1);
            store.upsert_job("rotate-tokens", "d", due).await.unwrap();
            store.claim_runs("controller-a", 10).await.unwrap();

            store.heartbeat("controller-a", Utc::now());

            let reaped = store
                .reap_dead_runs(Utc::now(), ChronoDuration::minutes(1))
                .await
                .unwrap();
            assert_eq!(reaped, 0);
            assert_eq!(store.running_count(), 1);
        }

        #[tokio::test]
        async fn external_interrupt_sets_status_without_touching_ended_at() {
            let store = InMemoryPersistence::new();
            let due = Utc::now() - ChronoDuration::seconds(1);
            store.upsert_job("rotate-tokens", "d", due).await.unwrap();
            let run = store.claim_runs("controller-a", 10).await.unwrap().remove(0);

            store.external_interrupt(run.run_id);

            let persisted = store.lookup_run(run.run_id).await.unwrap();
            assert_eq!(persisted.status, crate::job::RunStatus::Interrupted);
            assert!(persisted.ended_at.is_none());
        }

        #[tokio::test]
        async fn rendezvous_job_blocks_until_released() {
            let job = RendezvousJob::new("rotate-tokens");
            let cancel = CancellationToken::new();
            let job_for_run = job.clone();
            let cancel_for_run = cancel.clone();
            let handle = tokio::spawn(async move { job_for_run.run(cancel_for_run).await });

            job.wait_until_started().await;
            job.release();
            handle.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn rendezvous_job_honors_cancellation() {
            let job = RendezvousJob::new("rotate-tokens");
            let cancel = CancellationToken::new();
            let job_for_run = job.clone();
            let cancel_for_run = cancel.clone();
            let handle = tokio::spawn(async move { job_for_run.run(cancel_for_run).await });

            job.wait_until_started().await;
            cancel.cancel();
            handle.await.unwrap().unwrap();
        }

        #[tokio::test]
        async fn rendezvous_job_reports_set_status() {
            let job = RendezvousJob::new("rotate-tokens");
            assert!(job.status().is_valid());
            job.set_status(JobStatus::new(10, 4));
            assert_eq!(job.status(), JobStatus::new(10, 4));
        }
    }
}
