//! The periodic sweeper: persists progress from live runs, honors external
//! interrupt signals, and reaps runs abandoned by dead controllers.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::job::RunStatus;
use crate::persistence::Persistence;
use crate::worker::LiveRuns;

/// One sweep of the monitor loop.
///
/// Runs one isolated concurrent unit per live run so a single slow or
/// blocking status capture does not delay progress persistence for the
/// others, then separately reaps runs whose owning controller has gone
/// quiet.
pub(crate) async fn monitor_tick(live_runs: LiveRuns, persistence: Arc<dyn Persistence>, liveness_window: Duration) {
    let snapshot: Vec<_> = {
        let live = live_runs.read().unwrap_or_else(|e| e.into_inner());
        live.iter()
            .map(|(job_name, running)| (job_name.clone(), running.run_id, running.job.clone(), running.cancel.clone()))
            .collect()
    };

    let tasks = snapshot.into_iter().map(|(job_name, run_id, job, cancel)| {
        let persistence = persistence.clone();
        tokio::spawn(async move {
            let status = job.status();
            if status.is_valid() {
                if let Err(err) = persistence
                    .update_run_progress(run_id, status.total, status.completed, Utc::now())
                    .await
                {
                    error!(job_name = %job_name, run_id = %run_id, error = %err, "failed to persist run progress");
                }
            } else {
                debug!(job_name = %job_name, run_id = %run_id, "discarding invalid progress snapshot");
            }

            match persistence.lookup_run(run_id).await {
                Ok(run) if run.status == RunStatus::Interrupted => {
                    warn!(job_name = %job_name, run_id = %run_id, "run marked interrupted, cancelling");
                    cancel.cancel();
                }
                Ok(_) => {}
                Err(err) => {
                    error!(job_name = %job_name, run_id = %run_id, error = %err, "failed to check run status");
                }
            }
        })
    });

    join_all(tasks).await;

    match persistence.reap_dead_runs(Utc::now(), liveness_window).await {
        Ok(0) => {}
        Ok(count) => warn!(count, "reaped runs from dead controllers"),
        Err(err) => error!(error = %err, "failed to reap dead runs"),
    }
}
