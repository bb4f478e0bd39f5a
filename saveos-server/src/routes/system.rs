use crate::error::AppError;
use crate::models::job::JobStatus;
use crate::models::{agent, job, snapshot};
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
pub struct Metrics {
    pub agents_total: i64,
    pub jobs_total: i64,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub snapshots_total: i64,
    pub queue_depth: usize,
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Json<Metrics>, AppError> {
    let db = state.db.clone();
    let queue_depth = state.dispatcher.depth();
    let metrics = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let mut jobs_by_status: BTreeMap<String, i64> = [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ]
        .iter()
        .map(|s| (s.to_string(), 0))
        .collect();
        for (status, count) in job::count_by_status(&conn)? {
            jobs_by_status.insert(status.to_string(), count);
        }

        Ok::<_, anyhow::Error>(Metrics {
            agents_total: agent::count(&conn)?,
            jobs_total: job::count(&conn)?,
            jobs_by_status,
            snapshots_total: snapshot::count(&conn)?,
            queue_depth,
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(metrics))
}
