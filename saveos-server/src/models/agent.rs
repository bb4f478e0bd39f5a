use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    Error,
}

text_enum!(AgentStatus, "agent status", {
    Active => "active",
    Inactive => "inactive",
    Error => "error",
});

// ── Agent ──

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: i64,
    pub tenant_id: i64,
    pub hostname: String,
    pub platform: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub config: Option<String>, // JSON object stored as text
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub hostname: String,
    pub platform: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Returned by registration; the only place besides provisioning where the
/// plaintext token leaves the server.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisteredAgent {
    pub id: i64,
    pub hostname: String,
    pub platform: String,
    pub token: String,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionAgentRequest {
    pub hostname: String,
    pub platform: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionedAgent {
    pub agent_id: i64,
    pub token: String,
    pub hostname: String,
    pub platform: String,
    pub api_url: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: AgentStatus,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_snapshots: i64,
    pub total_size_bytes: i64,
    pub last_backup: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}

pub struct NewAgent<'a> {
    pub tenant_id: i64,
    pub hostname: &'a str,
    pub platform: &'a str,
    pub token_hash: &'a str,
    pub status: AgentStatus,
    pub config: Option<String>,
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        hostname: row.get("hostname")?,
        platform: row.get("platform")?,
        token_hash: row.get("token_hash")?,
        status: row.get("status")?,
        last_seen: row.get("last_seen")?,
        config: row.get("config")?,
        created_at: row.get("created_at")?,
    })
}

/// Serializes a free-form config blob; empty objects are stored as NULL.
pub fn config_to_text(config: Option<&serde_json::Value>) -> anyhow::Result<Option<String>> {
    match config {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => Ok(Some(serde_json::to_string(value)?)),
    }
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<Agent>> {
    let agent = conn
        .query_row("SELECT * FROM agents WHERE id = ?", params![id], row_to_agent)
        .optional()?;
    Ok(agent)
}

pub fn find_by_token_hash(conn: &Connection, token_hash: &str) -> anyhow::Result<Option<Agent>> {
    let agent = conn
        .query_row(
            "SELECT * FROM agents WHERE token_hash = ?",
            params![token_hash],
            row_to_agent,
        )
        .optional()?;
    Ok(agent)
}

pub fn find_by_hostname(
    conn: &Connection,
    tenant_id: i64,
    hostname: &str,
) -> anyhow::Result<Option<Agent>> {
    let agent = conn
        .query_row(
            "SELECT * FROM agents WHERE tenant_id = ? AND hostname = ?",
            params![tenant_id, hostname],
            row_to_agent,
        )
        .optional()?;
    Ok(agent)
}

pub fn create(conn: &Connection, data: &NewAgent) -> anyhow::Result<Agent> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO agents (tenant_id, hostname, platform, token_hash, status, last_seen, config, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            data.tenant_id,
            data.hostname,
            data.platform,
            data.token_hash,
            data.status,
            now,
            data.config,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created agent"))
}

/// Re-registration of a known hostname: refresh its details, mark it active
/// and swap in a freshly issued token.
pub fn update_registration(
    conn: &Connection,
    id: i64,
    platform: &str,
    config: Option<String>,
    token_hash: &str,
) -> anyhow::Result<Agent> {
    conn.execute(
        "UPDATE agents SET platform = ?1, config = ?2, token_hash = ?3, status = 'active', last_seen = ?4
         WHERE id = ?5",
        params![platform, config, token_hash, Utc::now(), id],
    )?;
    find_by_id(conn, id)?.ok_or_else(|| anyhow::anyhow!("Agent {} disappeared", id))
}

pub fn touch(conn: &Connection, id: i64) -> anyhow::Result<DateTime<Utc>> {
    let now = Utc::now();
    conn.execute(
        "UPDATE agents SET last_seen = ? WHERE id = ?",
        params![now, id],
    )?;
    Ok(now)
}

pub fn record_heartbeat(
    conn: &Connection,
    id: i64,
    status: AgentStatus,
    config: Option<String>,
) -> anyhow::Result<DateTime<Utc>> {
    let now = Utc::now();
    match config {
        Some(config) => conn.execute(
            "UPDATE agents SET status = ?1, last_seen = ?2, config = ?3 WHERE id = ?4",
            params![status, now, config, id],
        )?,
        None => conn.execute(
            "UPDATE agents SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status, now, id],
        )?,
    };
    Ok(now)
}

pub fn count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?)
}
