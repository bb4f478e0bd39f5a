use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::IntoResponse;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::agent;
use crate::services::token;
use crate::state::AppState;

/// Resolves the bearer token to an [`agent::Agent`], refreshes its
/// `last_seen`, and makes it available to handlers as an `Extension`.
pub async fn require_agent(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, AppError> {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(token::parse_bearer)
        .ok_or_else(|| AppError::Unauthorized("Missing or malformed Bearer token".into()))?
        .to_string();

    let db = state.db.clone();
    let agent = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<agent::Agent>> {
        let conn = db.get()?;
        let Some(mut agent) = agent::find_by_token_hash(&conn, &token::hash(&presented))? else {
            return Ok(None);
        };
        if !token::verify(&presented, &agent.token_hash) {
            return Ok(None);
        }
        agent.last_seen = agent::touch(&conn, agent.id)?;
        Ok(Some(agent))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| AppError::Unauthorized("Invalid token".into()))?;

    tracing::debug!(agent_id = agent.id, hostname = %agent.hostname, "Agent authenticated");
    req.extensions_mut().insert(agent);
    Ok(next.run(req).await)
}
