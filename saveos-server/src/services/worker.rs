use chrono::Utc;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, BorgRepository};
use crate::models::agent::{self, Agent};
use crate::models::job::{self, Job, JobStatus, JobType};
use crate::models::snapshot::NewSnapshot;
use crate::services::dispatcher::TaskReceiver;
use crate::services::job_state::{self, FailFrom, Lease, TransitionError};
use crate::state::AppState;

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(100);

/// Backup parameters carried in a job's config blob.
#[derive(Debug, Default, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub source_paths: Vec<String>,
    /// Relative to the server's repository root.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl BackupConfig {
    pub fn from_job(job: &Job) -> Result<Self, String> {
        let config: Self = match job.config.as_deref() {
            None => Self::default(),
            Some(text) => serde_json::from_str(text)
                .map_err(|e| format!("invalid backup config: {e}"))?,
        };
        if config.source_paths.iter().all(|p| p.trim().is_empty()) {
            return Err("backup config has no source_paths".into());
        }
        if let Some(bad) = config.source_paths.iter().find(|p| p.trim_start().starts_with('-')) {
            return Err(format!("invalid source path {bad:?}: must not start with '-'"));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { snapshot_id: i64 },
    Failed { message: String },
    /// Not pending any more (duplicate delivery) or gone.
    Skipped,
    /// Lost the lease before finishing; the result was discarded.
    Discarded,
    /// Timed out; the archive command was stopped and the job left `running`
    /// for the reconciler.
    Abandoned,
}

/// Spawns `worker_count` workers pulling from `rx` until `cancel` fires or
/// the queue closes. A worker finishes its current job before stopping.
pub fn start_workers(
    state: Arc<AppState>,
    rx: TaskReceiver,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..state.config.worker_count.max(1))
        .map(|worker_id| {
            let state = state.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        _ = cancel.cancelled() => break,
                        task = async { rx.lock().await.recv().await } => task,
                    };
                    let Some(task) = task else { break };

                    tracing::info!(worker_id, job_id = task.job_id, task_id = %task.task_id, "Picked up job");
                    match process_job(&state, task.job_id).await {
                        Ok(outcome) => {
                            tracing::info!(worker_id, job_id = task.job_id, ?outcome, "Job processed")
                        }
                        Err(e) => {
                            tracing::error!(worker_id, job_id = task.job_id, error = %e, "Job processing failed")
                        }
                    }
                }
                tracing::info!(worker_id, "Worker stopped");
            })
        })
        .collect()
}

/// Claims a pending job, runs it while holding its lease, and records the
/// result.
pub async fn process_job(state: &Arc<AppState>, job_id: i64) -> anyhow::Result<JobOutcome> {
    let db = state.db.clone();
    let ttl = state.config.lease_ttl;
    // Err carries the outcome for a job that is not run at all.
    let claimed = tokio::task::spawn_blocking(
        move || -> anyhow::Result<Result<(Job, Agent, Lease), JobOutcome>> {
            let conn = db.get()?;
            let Some(job) = job::find_by_id(&conn, job_id)? else {
                tracing::warn!(job_id, "Queued job no longer exists");
                return Ok(Err(JobOutcome::Skipped));
            };
            if job.status != JobStatus::Pending {
                tracing::info!(job_id, status = %job.status, "Skipping job that is not pending");
                return Ok(Err(JobOutcome::Skipped));
            }
            let Some(agent) = agent::find_by_id(&conn, job.agent_id)? else {
                let message = format!("agent {} no longer exists", job.agent_id);
                job_state::mark_failed(&conn, job_id, FailFrom::Pending, &message)?;
                tracing::warn!(job_id, agent_id = job.agent_id, "Failed job whose agent is gone");
                return Ok(Err(JobOutcome::Failed { message }));
            };

            match job_state::mark_running(&conn, job_id, ttl) {
                Ok(lease) => Ok(Ok((job, agent, lease))),
                Err(TransitionError::IllegalTransition { from, .. }) => {
                    tracing::info!(job_id, %from, "Job was claimed elsewhere");
                    Ok(Err(JobOutcome::Skipped))
                }
                Err(e) => Err(e.into()),
            }
        },
    )
    .await??;

    let (job, agent, mut lease) = match claimed {
        Ok(claim) => claim,
        Err(outcome) => return Ok(outcome),
    };

    let mut execution = {
        let state = state.clone();
        tokio::spawn(async move { execute(&state, &job, &agent).await })
    };

    let timeout = state.config.job_timeout;
    let finished = tokio::time::timeout(timeout, run_holding_lease(state, &mut lease, &mut execution)).await;
    let result = match finished {
        Ok(result) => result,
        Err(_) => {
            // Aborting drops the runner's future, which kills the archive tool.
            execution.abort();
            tracing::error!(
                job_id,
                timeout_ms = timeout.as_millis() as u64,
                "Job timed out; archive command stopped, leaving it for reconciliation"
            );
            return Ok(JobOutcome::Abandoned);
        }
    };

    let result = match result {
        Ok(result) => result,
        Err(join_error) => Err(format!("worker crashed: {join_error}")),
    };

    let db = state.db.clone();
    let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<JobOutcome> {
        let mut conn = db.get()?;
        let recorded = match &result {
            Ok(data) => job_state::mark_completed(&mut conn, &lease, data)
                .map(|snapshot| JobOutcome::Completed { snapshot_id: snapshot.id }),
            Err(message) => job_state::mark_failed(&conn, job_id, FailFrom::Running(&lease), message)
                .map(|()| JobOutcome::Failed { message: message.clone() }),
        };
        match recorded {
            Ok(outcome) => Ok(outcome),
            Err(TransitionError::LeaseLost(_)) | Err(TransitionError::IllegalTransition { .. }) => {
                tracing::warn!(job_id, "Lease lost before the result was recorded; discarding it");
                Ok(JobOutcome::Discarded)
            }
            Err(e) => Err(e.into()),
        }
    })
    .await??;

    match &outcome {
        JobOutcome::Completed { snapshot_id } => {
            tracing::info!(job_id, snapshot_id, "Backup completed")
        }
        JobOutcome::Failed { message } => tracing::warn!(job_id, error = %message, "Job failed"),
        _ => {}
    }
    Ok(outcome)
}

/// Awaits `task` while renewing the lease every third of its TTL.
async fn run_holding_lease<T>(
    state: &Arc<AppState>,
    lease: &mut Lease,
    task: &mut JoinHandle<T>,
) -> Result<T, JoinError> {
    let ttl = state.config.lease_ttl;
    let period = (ttl / 3).max(MIN_RENEW_PERIOD);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            result = &mut *task => return result,
            _ = ticker.tick() => {
                let db = state.db.clone();
                let mut renewed = lease.clone();
                let renewal = tokio::task::spawn_blocking(move || -> anyhow::Result<Lease> {
                    let conn = db.get()?;
                    job_state::renew_lease(&conn, &mut renewed, ttl)?;
                    Ok(renewed)
                })
                .await;
                match renewal {
                    Ok(Ok(renewed)) => *lease = renewed,
                    Ok(Err(e)) => tracing::warn!(job_id = lease.job_id, error = %e, "Lease renewal failed"),
                    Err(e) => tracing::warn!(job_id = lease.job_id, error = %e, "Lease renewal task failed"),
                }
            }
        }
    }
}

async fn execute(state: &AppState, job: &Job, agent: &Agent) -> Result<NewSnapshot, String> {
    match job.job_type {
        JobType::Backup => execute_backup(state, job, agent).await,
        other => Err(format!("{other} jobs are not executed by this server")),
    }
}

async fn execute_backup(state: &AppState, job: &Job, agent: &Agent) -> Result<NewSnapshot, String> {
    let config = BackupConfig::from_job(job)?;
    let sources: Vec<String> = config
        .source_paths
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect();

    let repo_path = resolve_repo_path(&state.config.repos_dir, config.repo_path.as_deref(), &agent.hostname)?;
    let passphrase = config
        .passphrase
        .filter(|p| !p.is_empty())
        .or_else(|| state.config.default_passphrase.clone())
        .ok_or_else(|| "no repository passphrase configured".to_string())?;

    let repo = BorgRepository::new(
        state.archive.clone(),
        state.config.borg_binary.clone(),
        repo_path.clone(),
        Some(passphrase),
    );

    let initialized = repo.ensure_repository().await.map_err(|e| e.to_string())?;
    let name = archive::archive_name(&agent.hostname, Utc::now());
    tracing::info!(job_id = job.id, archive = %name, repo = %repo_path.display(), "Creating archive");
    let outcome = repo.create_backup(&sources, &name).await.map_err(|e| e.to_string())?;

    let checksum = match repo.list_archives().await {
        Ok(listing) => {
            if let Some(diagnostics) = listing.diagnostics {
                tracing::warn!(job_id = job.id, %diagnostics, "Archive listing failed");
            }
            listing
                .archives
                .into_iter()
                .find(|a| a.name == name)
                .and_then(|a| a.id)
        }
        Err(e) => {
            tracing::warn!(job_id = job.id, error = %e, "Archive listing failed");
            None
        }
    };

    let stats = outcome.stats;
    Ok(NewSnapshot {
        name: outcome.archive_name,
        repo_path: repo_path.to_string_lossy().into_owned(),
        size_bytes: stats.compressed_size.and_then(|v| i64::try_from(v).ok()),
        original_size_bytes: stats.original_size.and_then(|v| i64::try_from(v).ok()),
        deduplicated_size_bytes: stats.deduplicated_size.and_then(|v| i64::try_from(v).ok()),
        is_full: initialized,
        checksum,
    })
}

/// Repositories live under `root`: one per host by default, or at a
/// relative path the job names. Paths escaping `root` are refused.
fn resolve_repo_path(root: &Path, requested: Option<&Path>, hostname: &str) -> Result<PathBuf, String> {
    let relative = match requested {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(safe_component(hostname)),
    };

    let escapes = relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(format!(
            "repo_path {} must be a relative path inside the repository root",
            relative.display()
        ));
    }
    Ok(root.join(relative))
}

fn safe_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}
