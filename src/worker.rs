//! Per-run cancellable execution and the live-runs map the monitor reads.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobRun, RunOutcome};
use crate::persistence::Persistence;
use crate::registry::JobRegistry;

/// A live worker's handler, cancellation handle, and the run it is
/// executing, as seen by the monitor loop.
#[derive(Clone)]
pub(crate) struct RunningJob {
    pub run_id: Uuid,
    pub job: Arc<dyn Job>,
    pub cancel: CancellationToken,
}

/// Concurrency-safe map of job name to its live run, mutated by the run
/// loop (insert) and by workers (remove on completion); read-only for the
/// monitor.
pub(crate) type LiveRuns = Arc<RwLock<HashMap<String, RunningJob>>>;

pub(crate) fn new_live_runs() -> LiveRuns {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Execute one claimed run to completion and persist its outcome.
///
/// The caller is responsible for inserting `run.job_name` into `live_runs`
/// before spawning this future (so the bounded-concurrency check in the run
/// loop and the insert happen under the same lock) and must not spawn a
/// second execution for the same job name while one is live.
pub(crate) async fn execute_run(
    job: Arc<dyn Job>,
    run: JobRun,
    persistence: Arc<dyn Persistence>,
    registry: Arc<JobRegistry>,
    live_runs: LiveRuns,
    cancel: CancellationToken,
) {
    let job_name = run.job_name.clone();
    let run_id = run.run_id;

    info!(job_name = %job_name, run_id = %run_id, "job run started");

    let outcome = match job.run(cancel).await {
        Ok(()) => {
            info!(job_name = %job_name, run_id = %run_id, "job run completed");
            RunOutcome::Completed
        }
        Err(err) => {
            warn!(job_name = %job_name, run_id = %run_id, error = %err, "job run failed");
            RunOutcome::Failed
        }
    };

    // Remove from the live map before the durable terminal transition so the
    // monitor never observes a terminal row still backed by a live entry.
    {
        let mut live = live_runs.write().unwrap_or_else(|e| e.into_inner());
        live.remove(&job_name);
    }

    if let Err(err) = persistence.complete_run(run_id, outcome, Utc::now()).await {
        error!(job_name = %job_name, run_id = %run_id, error = %err, "failed to persist run outcome");
    }

    if let Err(err) = registry.update_next_run(&job_name, job.next_run_in()).await {
        error!(job_name = %job_name, error = %err, "failed to reschedule job after run");
    }
}
