use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub job_id: i64,
    pub name: String,
    pub repo_path: String,
    /// Compressed size reported by the archive tool; `None` when its
    /// statistics could not be parsed.
    pub size_bytes: Option<i64>,
    pub original_size_bytes: Option<i64>,
    pub deduplicated_size_bytes: Option<i64>,
    pub is_full: bool,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub name: String,
    pub repo_path: String,
    pub size_bytes: Option<i64>,
    pub original_size_bytes: Option<i64>,
    pub deduplicated_size_bytes: Option<i64>,
    pub is_full: bool,
    pub checksum: Option<String>,
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        name: row.get("name")?,
        repo_path: row.get("repo_path")?,
        size_bytes: row.get("size_bytes")?,
        original_size_bytes: row.get("original_size_bytes")?,
        deduplicated_size_bytes: row.get("deduplicated_size_bytes")?,
        is_full: row.get("is_full")?,
        checksum: row.get("checksum")?,
        created_at: row.get("created_at")?,
    })
}

/// Inserts the snapshot for `job_id`. Callers run this inside the same
/// transaction that completes the job.
pub fn insert(conn: &Connection, job_id: i64, data: &NewSnapshot) -> rusqlite::Result<Snapshot> {
    conn.execute(
        "INSERT INTO snapshots (job_id, name, repo_path, size_bytes, original_size_bytes, deduplicated_size_bytes, is_full, checksum, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            job_id,
            data.name,
            data.repo_path,
            data.size_bytes,
            data.original_size_bytes,
            data.deduplicated_size_bytes,
            data.is_full,
            data.checksum,
            Utc::now(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row("SELECT * FROM snapshots WHERE id = ?", params![id], row_to_snapshot)
}

pub fn find_by_job_id(conn: &Connection, job_id: i64) -> rusqlite::Result<Option<Snapshot>> {
    conn.query_row(
        "SELECT * FROM snapshots WHERE job_id = ?",
        params![job_id],
        row_to_snapshot,
    )
    .optional()
}

/// Snapshots produced by the agent's jobs, newest first.
pub fn find_by_agent_id(conn: &Connection, agent_id: i64) -> anyhow::Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare(
        "SELECT s.* FROM snapshots s JOIN jobs j ON j.id = s.job_id
         WHERE j.agent_id = ? ORDER BY s.created_at DESC, s.id DESC",
    )?;
    let rows = stmt.query_map(params![agent_id], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Snapshot count and summed size for an agent; unparsed sizes count as zero.
pub fn totals_for_agent(conn: &Connection, agent_id: i64) -> anyhow::Result<(i64, i64)> {
    let totals = conn.query_row(
        "SELECT COUNT(s.id), COALESCE(SUM(s.size_bytes), 0) FROM snapshots s
         JOIN jobs j ON j.id = s.job_id WHERE j.agent_id = ?",
        params![agent_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(totals)
}

pub fn count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?)
}
