use crate::error::AppError;
use crate::models::agent::Agent;
use crate::models::job::{self, Job};
use crate::routes::middleware::require_agent;
use crate::state::AppState;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{middleware, Extension, Json, Router};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
        .route_layer(middleware::from_fn_with_state(state, require_agent))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<Agent>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<Vec<Job>>, AppError> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let db = state.db.clone();
    let jobs = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        job::find_by_agent_id(&conn, agent.id, limit)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(jobs))
}

/// Unknown ids are 404 for everyone; other agents' jobs are 403.
async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<Agent>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, AppError> {
    let db = state.db.clone();
    let job = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        Ok::<_, anyhow::Error>(job::find_by_id(&conn, id)?)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    match job {
        Some(j) if j.agent_id == agent.id => Ok(Json(j)),
        Some(_) => Err(AppError::Forbidden("Cannot read another agent's job".into())),
        None => Err(AppError::NotFound("Job not found".into())),
    }
}
