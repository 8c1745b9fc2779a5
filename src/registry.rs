//! In-memory binding of job names to handlers, plus the persisted upsert
//! that happens on registration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::persistence::Persistence;

/// Maps registered job names to their handler, and is the boundary at which
/// `RegisterJob` validates its input and upserts the job row.
///
/// Distinct from the database's notion of a job: the registry is
/// process-local, the database row is shared fleet-wide. A name present in
/// the database but absent here is simply invisible to this controller's
/// claim attempts.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
    persistence: Arc<dyn Persistence>,
}

impl JobRegistry {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    /// Register `job`, upserting its row and binding its name in-process.
    ///
    /// Fails with [`SchedulerError::InvalidArgument`] when `job.name()` is
    /// empty, and with [`SchedulerError::AlreadyRegistered`] when this
    /// process already bound that name to a different handler.
    pub async fn register(&self, job: Arc<dyn Job>) -> Result<()> {
        if job.name().is_empty() {
            return Err(SchedulerError::invalid_argument("job name must not be empty"));
        }

        {
            let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = jobs.get(job.name()) {
                if !Arc::ptr_eq(existing, &job) {
                    return Err(SchedulerError::AlreadyRegistered {
                        name: job.name().to_string(),
                    });
                }
                return Ok(());
            }
        }

        self.persistence
            .upsert_job(job.name(), job.description(), Utc::now())
            .await?;

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.entry(job.name().to_string()).or_insert(job);
        Ok(())
    }

    /// Set `name`'s `next_scheduled_run` to `now + in`.
    pub async fn update_next_run(&self, name: &str, r#in: chrono::Duration) -> Result<()> {
        self.persistence.update_job_next_run(name, Utc::now() + r#in).await
    }

    /// Look up a registered handler by name. Used by the worker to resolve
    /// a claimed run back to its handler.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(name).cloned()
    }

    /// Number of job names bound in this process. Exposed for tests.
    pub fn len(&self) -> usize {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::persistence::testing::InMemoryPersistence;
    use tokio_util::sync::CancellationToken;

    struct NoopJob {
        name: String,
    }

    #[async_trait::async_trait]
    impl Job for NoopJob {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "noop"
        }
        fn next_run_in(&self) -> chrono::Duration {
            chrono::Duration::hours(1)
        }
        async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
        fn status(&self) -> JobStatus {
            JobStatus::default()
        }
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(InMemoryPersistence::new()))
    }

    #[tokio::test]
    async fn register_rejects_empty_name() {
        let registry = registry();
        let job = Arc::new(NoopJob { name: String::new() });
        let err = registry.register(job).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn register_binds_name_and_upserts() {
        let registry = registry();
        let job = Arc::new(NoopJob { name: "rotate-tokens".into() });
        registry.register(job.clone()).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("rotate-tokens").is_some());
    }

    #[tokio::test]
    async fn registering_same_arc_twice_is_idempotent() {
        let registry = registry();
        let job = Arc::new(NoopJob { name: "rotate-tokens".into() });
        registry.register(job.clone()).await.unwrap();
        registry.register(job).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn registering_different_definition_same_name_fails() {
        let registry = registry();
        let first = Arc::new(NoopJob { name: "rotate-tokens".into() });
        let second = Arc::new(NoopJob { name: "rotate-tokens".into() });
        registry.register(first).await.unwrap();

        let err = registry.register(second).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn update_next_run_surfaces_not_found() {
        let registry = registry();
        let err = registry
            .update_next_run("missing", chrono::Duration::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_next_run_succeeds_for_registered_job() {
        let registry = registry();
        let job = Arc::new(NoopJob { name: "rotate-tokens".into() });
        registry.register(job).await.unwrap();

        registry
            .update_next_run("rotate-tokens", chrono::Duration::zero())
            .await
            .unwrap();
    }
}
