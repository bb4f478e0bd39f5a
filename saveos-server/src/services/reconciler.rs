use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::models::job::{self, JobStatus};
use crate::services::job_state::{self, FailFrom, Reclaimed};
use crate::state::AppState;

/// Periodically reclaims `running` jobs whose worker stopped renewing its
/// lease: they go back to the queue, or fail once out of attempts.
pub struct Reconciler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl Reconciler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let state = self.state.clone();
        let cron = self.state.config.reconcile_cron.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = reconcile_once(&state).await {
                    tracing::error!(error = %e, "Lease reconciliation failed");
                }
            })
        })?;

        let scheduler = self.scheduler.lock().await;
        scheduler.add(job).await?;
        scheduler.start().await?;
        tracing::info!(cron = %cron, "Lease reconciler scheduled");
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// One reconciliation pass. Requeued jobs are handed back to the dispatcher;
/// one the dispatcher refuses is failed.
pub async fn reconcile_once(state: &Arc<AppState>) -> anyhow::Result<Reclaimed> {
    let db = state.db.clone();
    let max_attempts = state.config.max_job_attempts;
    let reclaimed = tokio::task::spawn_blocking(move || -> anyhow::Result<Reclaimed> {
        let conn = db.get()?;
        Ok(job_state::reclaim_expired(&conn, Utc::now(), max_attempts)?)
    })
    .await??;

    for &job_id in &reclaimed.requeued {
        match state.dispatcher.enqueue(job_id) {
            Ok(_) => tracing::info!(job_id, "Requeued job with expired lease"),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not requeue job with expired lease");
                fail_unqueued(state, job_id, format!("failed to requeue job after lease expiry: {e}")).await;
            }
        }
    }
    for job_id in &reclaimed.failed {
        tracing::warn!(job_id, "Job with expired lease is out of attempts; marked failed");
    }

    Ok(reclaimed)
}

/// Re-enqueues jobs left `pending` by a previous process; the queue is in
/// memory and does not survive restarts. Jobs that no longer fit in the
/// queue are failed. Returns how many were enqueued.
pub async fn recover_pending(state: &Arc<AppState>) -> anyhow::Result<usize> {
    let db = state.db.clone();
    let pending = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<i64>> {
        let conn = db.get()?;
        Ok(job::ids_with_status(&conn, JobStatus::Pending)?)
    })
    .await??;

    let mut enqueued = 0;
    for job_id in pending {
        match state.dispatcher.enqueue(job_id) {
            Ok(_) => enqueued += 1,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not re-enqueue pending job");
                fail_unqueued(state, job_id, format!("failed to enqueue job after restart: {e}")).await;
            }
        }
    }
    Ok(enqueued)
}

/// Fails a `pending` job that is in no queue. Errors are logged so one bad
/// job does not stop the caller's pass.
async fn fail_unqueued(state: &Arc<AppState>, job_id: i64, message: String) {
    let db = state.db.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let conn = db.get()?;
        Ok(job_state::mark_failed(&conn, job_id, FailFrom::Pending, &message)?)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(job_id, error = %e, "Failed to mark unqueued job failed"),
        Err(e) => tracing::error!(job_id, error = %e, "Failed to mark unqueued job failed"),
    }
}
