use crate::error::AppError;
use crate::models::agent::Agent;
use crate::models::job::{CreateJobRequest, Job};
use crate::models::snapshot::{self, Snapshot};
use crate::routes::middleware::require_agent;
use crate::services::job_state::{self, FailFrom};
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_backup))
        .route("/{agent_id}/snapshots", get(list_snapshots))
        .route_layer(middleware::from_fn_with_state(state, require_agent))
}

/// Persists a `pending` job for the caller and hands it to the workers. If
/// the queue refuses it the job is failed and the request errors.
async fn create_backup(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<Agent>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Json<Job>, AppError> {
    let Json(body) = body?;
    let config = match &body.config {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(serde_json::to_string(value).map_err(anyhow::Error::from)?),
    };

    let db = state.db.clone();
    let job = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        job_state::create(&conn, &agent, body.agent_id, body.job_type, config).map_err(AppError::from)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    match state.dispatcher.enqueue(job.id) {
        Ok(handle) => {
            tracing::info!(job_id = job.id, agent_id = job.agent_id, task_id = %handle.0, "Backup job queued");
            Ok(Json(job))
        }
        Err(dispatch_error) => {
            tracing::error!(job_id = job.id, error = %dispatch_error, "Failed to enqueue job");
            let db = state.db.clone();
            let message = format!("failed to enqueue job: {dispatch_error}");
            let job_id = job.id;
            tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                job_state::mark_failed(&conn, job_id, FailFrom::Pending, &message)?;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .map_err(|e| anyhow::anyhow!(e))??;
            Err(dispatch_error.into())
        }
    }
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<Agent>,
    Path(agent_id): Path<i64>,
) -> Result<Json<Vec<Snapshot>>, AppError> {
    if agent_id != agent.id {
        return Err(AppError::Forbidden("Cannot read another agent's snapshots".into()));
    }

    let db = state.db.clone();
    let snapshots = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        snapshot::find_by_agent_id(&conn, agent_id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(snapshots))
}
