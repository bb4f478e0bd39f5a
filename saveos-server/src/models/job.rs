use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Backup,
    Restore,
    Check,
}

text_enum!(JobType, "job type", {
    Backup => "backup",
    Restore => "restore",
    Check => "check",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

text_enum!(JobStatus, "job status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ── Job ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub agent_id: i64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Looked up from `snapshots.job_id`; jobs do not store it.
    pub snapshot_id: Option<i64>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub config: Option<String>, // may carry a passphrase, never serialized
    #[serde(skip)]
    pub lease_token: Option<String>,
    #[serde(skip)]
    pub lease_expires_at: Option<i64>, // unix millis
    #[serde(default)]
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub agent_id: i64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

const SELECT_JOB: &str =
    "SELECT j.*, s.id AS snapshot_id FROM jobs j LEFT JOIN snapshots s ON s.job_id = j.id";

pub(crate) fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        job_type: row.get("type")?,
        status: row.get("status")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        snapshot_id: row.get("snapshot_id")?,
        error_message: row.get("error_message")?,
        config: row.get("config")?,
        lease_token: row.get("lease_token")?,
        lease_expires_at: row.get("lease_expires_at")?,
        attempts: row.get("attempts")?,
        created_at: row.get("created_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        &format!("{SELECT_JOB} WHERE j.id = ?"),
        params![id],
        row_to_job,
    )
    .optional()
}

pub fn find_by_agent_id(conn: &Connection, agent_id: i64, limit: i64) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_JOB} WHERE j.agent_id = ? ORDER BY j.created_at DESC, j.id DESC LIMIT ?"
    ))?;
    let rows = stmt.query_map(params![agent_id, limit], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Ids of jobs in `status`, oldest first.
pub fn ids_with_status(conn: &Connection, status: JobStatus) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status = ? ORDER BY id")?;
    let rows = stmt.query_map(params![status], |row| row.get(0))?;
    rows.collect()
}

/// Running jobs whose lease deadline is at or before `now_ms`.
pub fn find_expired_leases(conn: &Connection, now_ms: i64) -> rusqlite::Result<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_JOB} WHERE j.status = 'running' AND j.lease_expires_at IS NOT NULL AND j.lease_expires_at <= ?
         ORDER BY j.id"
    ))?;
    let rows = stmt.query_map(params![now_ms], row_to_job)?;
    rows.collect()
}

pub fn last_completed_backup(conn: &Connection, agent_id: i64) -> anyhow::Result<Option<DateTime<Utc>>> {
    let finished = conn.query_row(
        "SELECT MAX(finished_at) FROM jobs WHERE agent_id = ? AND type = 'backup' AND status = 'completed'",
        params![agent_id],
        |row| row.get::<_, Option<DateTime<Utc>>>(0),
    )?;
    Ok(finished)
}

pub fn count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
}

pub fn count_by_status(conn: &Connection) -> anyhow::Result<Vec<(JobStatus, i64)>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_round_trip() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn job_serializes_without_secrets() {
        let job = Job {
            id: 1,
            agent_id: 2,
            job_type: JobType::Backup,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            snapshot_id: None,
            error_message: None,
            config: Some(r#"{"passphrase":"hunter2"}"#.into()),
            lease_token: Some("lease".into()),
            lease_expires_at: Some(0),
            attempts: 0,
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "backup");
        assert_eq!(value["status"], "pending");
        assert!(value.get("config").is_none());
        assert!(value.get("lease_token").is_none());
        assert!(!value.to_string().contains("hunter2"));
    }
}
