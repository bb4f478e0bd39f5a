use crate::error::AppError;
use crate::models::agent::{
    self, AgentStats, AgentStatus, HeartbeatRequest, NewAgent, ProvisionAgentRequest, ProvisionedAgent,
    RegisterAgentRequest, RegisteredAgent,
};
use crate::models::{job, snapshot, tenant};
use crate::routes::middleware::require_agent;
use crate::services::token;
use crate::state::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use rusqlite::TransactionBehavior;
use serde_json::json;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let authenticated = Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state, require_agent));

    Router::new()
        .route("/register", post(register))
        .route("/provision", post(provision))
        .merge(authenticated)
}

fn require_field(value: &str, name: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Unprocessable(format!("{name} is required")));
    }
    Ok(())
}

/// Registers a machine, or re-registers a known hostname. Either way a new
/// token is issued and returned; any previous token stops working.
async fn register(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RegisterAgentRequest>, JsonRejection>,
) -> Result<Json<RegisteredAgent>, AppError> {
    let Json(body) = body?;
    require_field(&body.hostname, "hostname")?;
    require_field(&body.platform, "platform")?;

    let db = state.db.clone();
    let (agent, token) = tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        // Serializes concurrent registrations of the same hostname.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tenant = tenant::find_or_create_default(&tx)?;
        let issued = token::issue();
        let config = agent::config_to_text(body.config.as_ref())?;

        let agent = match agent::find_by_hostname(&tx, tenant.id, &body.hostname)? {
            Some(existing) => {
                agent::update_registration(&tx, existing.id, &body.platform, config, &issued.hash)?
            }
            None => agent::create(
                &tx,
                &NewAgent {
                    tenant_id: tenant.id,
                    hostname: &body.hostname,
                    platform: &body.platform,
                    token_hash: &issued.hash,
                    status: AgentStatus::Active,
                    config,
                },
            )?,
        };
        tx.commit()?;
        Ok::<_, anyhow::Error>((agent, issued.plaintext))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(agent_id = agent.id, hostname = %agent.hostname, "Agent registered");
    Ok(Json(RegisteredAgent {
        id: agent.id,
        hostname: agent.hostname,
        platform: agent.platform,
        token,
        status: agent.status,
        last_seen: agent.last_seen,
        created_at: agent.created_at,
    }))
}

/// Pre-creates an inactive agent so its token can be installed ahead of the
/// first heartbeat.
async fn provision(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ProvisionAgentRequest>, JsonRejection>,
) -> Result<Json<ProvisionedAgent>, AppError> {
    let Json(body) = body?;
    require_field(&body.hostname, "hostname")?;
    require_field(&body.platform, "platform")?;

    let db = state.db.clone();
    let hostname = body.hostname.clone();
    let created = tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tenant = tenant::find_or_create_default(&tx)?;
        if agent::find_by_hostname(&tx, tenant.id, &body.hostname)?.is_some() {
            return Ok(None);
        }

        let issued = token::issue();
        let agent = agent::create(
            &tx,
            &NewAgent {
                tenant_id: tenant.id,
                hostname: &body.hostname,
                platform: &body.platform,
                token_hash: &issued.hash,
                status: AgentStatus::Inactive,
                config: None,
            },
        )?;
        tx.commit()?;
        Ok::<_, anyhow::Error>(Some((agent, issued.plaintext)))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let Some((agent, token)) = created else {
        return Err(AppError::Conflict(format!("Agent {hostname} already exists")));
    };

    tracing::info!(agent_id = agent.id, hostname = %agent.hostname, "Agent provisioned");
    Ok(Json(ProvisionedAgent {
        agent_id: agent.id,
        token,
        hostname: agent.hostname,
        platform: agent.platform,
        api_url: state.config.public_url.clone(),
    }))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<agent::Agent>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(body) = body?;

    let db = state.db.clone();
    let timestamp = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let config = agent::config_to_text(body.config.as_ref())?;
        agent::record_heartbeat(&conn, agent.id, body.status, config)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(json!({
        "message": "Heartbeat received",
        "timestamp": timestamp,
    })))
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(agent): Extension<agent::Agent>,
) -> Result<Json<AgentStats>, AppError> {
    let db = state.db.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let (total_snapshots, total_size_bytes) = snapshot::totals_for_agent(&conn, agent.id)?;
        let last_backup = job::last_completed_backup(&conn, agent.id)?;
        Ok::<_, anyhow::Error>(AgentStats {
            total_snapshots,
            total_size_bytes,
            last_backup,
            status: agent.status,
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(stats))
}
