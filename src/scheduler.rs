//! The scheduler façade: the single type embedders construct, register jobs
//! against, and start. Owns the run loop and the monitor loop and parents
//! both to a caller-supplied [`CancellationToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::monitor::monitor_tick;
use crate::persistence::Persistence;
use crate::registry::JobRegistry;
use crate::worker::{execute_run, new_live_runs, LiveRuns, RunningJob};

/// Tunables for the run loop and monitor loop, every one independently
/// overridable with a documented default.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SchedulerOptions {
    /// Max concurrent worker executions this controller will run at once.
    #[builder(default = 1)]
    pub run_jobs_limit: usize,

    /// How often the run loop asks persistence for due jobs to claim.
    #[builder(default = ChronoDuration::seconds(5))]
    pub run_jobs_interval: ChronoDuration,

    /// How often the monitor persists progress, checks for interrupts, and
    /// reaps dead controllers' runs.
    #[builder(default = ChronoDuration::seconds(30))]
    pub monitor_interval: ChronoDuration,

    /// Controller liveness window: a `running` row whose owning controller's
    /// heartbeat is older than this is reapable.
    #[builder(default = ChronoDuration::minutes(5))]
    pub interrupt_threshold: ChronoDuration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// `tokio::time::interval` panics on a zero period; clamp to 1ms so a
/// misconfigured-but-nonnegative interval degrades to a tight poll loop
/// instead of crashing the controller.
fn to_std(d: ChronoDuration, fallback_secs: u64) -> std::time::Duration {
    d.to_std()
        .unwrap_or(std::time::Duration::from_secs(fallback_secs))
        .max(std::time::Duration::from_millis(1))
}

/// Starts and owns the run loop and monitor loop for a single controller.
///
/// Construction is cheap and infallible apart from argument validation;
/// [`Scheduler::start`] is what actually spawns work, and is idempotent —
/// a second call returns [`SchedulerError::StateError`] rather than
/// double-spawning the loops.
pub struct Scheduler {
    controller_id: String,
    persistence: Arc<dyn Persistence>,
    registry: Arc<JobRegistry>,
    options: SchedulerOptions,
    live_runs: LiveRuns,
    started: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler for `controller_id`, backed by `persistence`.
    ///
    /// Fails with [`SchedulerError::InvalidArgument`] if `controller_id` is
    /// empty or `options.run_jobs_limit` is zero.
    pub fn new(
        controller_id: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let controller_id = controller_id.into();
        if controller_id.is_empty() {
            return Err(SchedulerError::invalid_argument("controller_id must not be empty"));
        }
        if options.run_jobs_limit == 0 {
            return Err(SchedulerError::invalid_argument("run_jobs_limit must be positive"));
        }

        Ok(Self {
            registry: Arc::new(JobRegistry::new(persistence.clone())),
            controller_id,
            persistence,
            options,
            live_runs: new_live_runs(),
            started: AtomicBool::new(false),
        })
    }

    /// Register `job`, upserting its row and binding it in this process.
    ///
    /// See [`JobRegistry::register`] for the exact failure modes.
    pub async fn register_job(&self, job: Arc<dyn Job>) -> Result<()> {
        self.registry.register(job).await
    }

    /// Set `name`'s `next_scheduled_run` to `now + in_`. Passing
    /// `ChronoDuration::zero()` makes the job immediately eligible.
    pub async fn update_job_next_run(&self, name: &str, in_: ChronoDuration) -> Result<()> {
        self.registry.update_next_run(name, in_).await
    }

    /// Number of job names registered in this process. Exposed for tests and
    /// embedder diagnostics.
    pub fn registered_job_count(&self) -> usize {
        self.registry.len()
    }

    /// Start the run loop and monitor loop, both parented to `scope`.
    ///
    /// Returns immediately; does not wait for either loop or for any worker
    /// to finish. Cancelling `scope` stops both loops and cancels every live
    /// worker's child scope, but `start` itself does not observe that —
    /// callers who need to wait for shutdown must do so externally.
    ///
    /// Idempotent in the sense that it can only ever succeed once: a second
    /// call on the same `Scheduler` returns [`SchedulerError::StateError`].
    pub fn start(self: &Arc<Self>, scope: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::StateError);
        }

        let run_loop_scheduler = self.clone();
        let run_loop_scope = scope.clone();
        tokio::spawn(async move { run_loop_scheduler.run_loop(run_loop_scope).await });

        let monitor_loop_scheduler = self.clone();
        let monitor_loop_scope = scope.clone();
        tokio::spawn(async move { monitor_loop_scheduler.monitor_loop(monitor_loop_scope).await });

        info!(controller_id = %self.controller_id, "scheduler started");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, scope: CancellationToken) {
        let mut ticker = tokio::time::interval(to_std(self.options.run_jobs_interval, 5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    info!(controller_id = %self.controller_id, "run loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.claim_tick(&scope).await;
                }
            }
        }
    }

    async fn claim_tick(&self, scope: &CancellationToken) {
        let live_count = self.live_runs.read().unwrap_or_else(|e| e.into_inner()).len();
        if live_count >= self.options.run_jobs_limit {
            return;
        }
        let limit = self.options.run_jobs_limit - live_count;

        let claimed = match self.persistence.claim_runs(&self.controller_id, limit).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(controller_id = %self.controller_id, error = %err, "claim_runs failed, retrying next tick");
                return;
            }
        };

        for run in claimed {
            let Some(job) = self.registry.lookup(&run.job_name) else {
                warn!(job_name = %run.job_name, "claimed a run for a job name not registered in this process");
                continue;
            };

            let cancel = scope.child_token();
            {
                let mut live = self.live_runs.write().unwrap_or_else(|e| e.into_inner());
                // The claim protocol guarantees single-flight per job_name;
                // this is a defensive check against a live entry surviving
                // an unexpected double-claim.
                if live.contains_key(&run.job_name) {
                    continue;
                }
                live.insert(
                    run.job_name.clone(),
                    RunningJob {
                        run_id: run.run_id,
                        job: job.clone(),
                        cancel: cancel.clone(),
                    },
                );
            }

            tokio::spawn(execute_run(
                job,
                run,
                self.persistence.clone(),
                self.registry.clone(),
                self.live_runs.clone(),
                cancel,
            ));
        }
    }

    async fn monitor_loop(self: Arc<Self>, scope: CancellationToken) {
        let mut ticker = tokio::time::interval(to_std(self.options.monitor_interval, 30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    info!(controller_id = %self.controller_id, "monitor loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    monitor_tick(self.live_runs.clone(), self.persistence.clone(), self.options.interrupt_threshold).await;
                }
            }
        }
    }
}
