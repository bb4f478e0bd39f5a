//! Job lifecycle: `pending -> running -> {completed | failed}`.
//!
//! Every transition is a single guarded `UPDATE` whose `WHERE` clause names the
//! state it leaves, so a transition that lost a race (or targets a terminal
//! job) changes nothing and is reported as an error instead of overwriting.
//! Running jobs hold a lease; leaving `running` requires the current lease
//! token.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::time::Duration;
use uuid::Uuid;

use crate::models::agent::Agent;
use crate::models::job::{self, Job, JobStatus, JobType};
use crate::models::snapshot::{self, NewSnapshot, Snapshot};

const UNKNOWN_FAILURE: &str = "unknown error";

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(i64),

    #[error("job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} is no longer held by this lease")]
    LeaseLost(i64),

    #[error("agent {caller} cannot create jobs for agent {target}")]
    ForeignAgent { caller: i64, target: i64 },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Proof that a worker moved a job to `running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Where a failure is recorded from.
#[derive(Debug, Clone, Copy)]
pub enum FailFrom<'a> {
    /// The job never left `pending`, e.g. it could not be enqueued.
    Pending,
    Running(&'a Lease),
}

/// Inserts a `pending` job. Agents may only create jobs for themselves.
pub fn create(
    conn: &Connection,
    caller: &Agent,
    agent_id: i64,
    job_type: JobType,
    config: Option<String>,
) -> Result<Job, TransitionError> {
    if caller.id != agent_id {
        return Err(TransitionError::ForeignAgent {
            caller: caller.id,
            target: agent_id,
        });
    }

    conn.execute(
        "INSERT INTO jobs (agent_id, type, status, config, created_at) VALUES (?1, ?2, 'pending', ?3, ?4)",
        params![agent_id, job_type, config, Utc::now()],
    )?;
    let id = conn.last_insert_rowid();
    job::find_by_id(conn, id)?.ok_or(TransitionError::NotFound(id))
}

/// `pending -> running`. Stamps `started_at`, hands out a lease valid for
/// `ttl`, and commits before any external work starts.
pub fn mark_running(conn: &Connection, job_id: i64, ttl: Duration) -> Result<Lease, TransitionError> {
    let now = Utc::now();
    let expires_at = now + ttl;
    let token = Uuid::new_v4().to_string();

    let changed = conn.execute(
        "UPDATE jobs SET status = 'running', started_at = ?1, lease_token = ?2, lease_expires_at = ?3,
                attempts = attempts + 1
         WHERE id = ?4 AND status = 'pending'",
        params![now, token, expires_at.timestamp_millis(), job_id],
    )?;
    if changed == 0 {
        return Err(rejected(conn, job_id, JobStatus::Running)?);
    }

    Ok(Lease {
        job_id,
        token,
        expires_at,
    })
}

/// Pushes the lease deadline out by `ttl`. Fails with `LeaseLost` once the
/// job has left `running` or the lease was reassigned.
pub fn renew_lease(conn: &Connection, lease: &mut Lease, ttl: Duration) -> Result<(), TransitionError> {
    let expires_at = Utc::now() + ttl;
    let changed = conn.execute(
        "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2 AND status = 'running' AND lease_token = ?3",
        params![expires_at.timestamp_millis(), lease.job_id, lease.token],
    )?;
    if changed == 0 {
        return Err(TransitionError::LeaseLost(lease.job_id));
    }
    lease.expires_at = expires_at;
    Ok(())
}

/// `running -> completed`, creating the job's snapshot in the same
/// transaction.
pub fn mark_completed(
    conn: &mut Connection,
    lease: &Lease,
    data: &NewSnapshot,
) -> Result<Snapshot, TransitionError> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE jobs SET status = 'completed', finished_at = ?1, lease_token = NULL, lease_expires_at = NULL
         WHERE id = ?2 AND status = 'running' AND lease_token = ?3",
        params![Utc::now(), lease.job_id, lease.token],
    )?;
    if changed == 0 {
        let err = lease_rejected(&tx, lease.job_id, JobStatus::Completed)?;
        return Err(err);
    }
    let snapshot = snapshot::insert(&tx, lease.job_id, data)?;
    tx.commit()?;
    Ok(snapshot)
}

/// `running -> failed` (or `pending -> failed` when the job never reached a
/// worker). The error text is never left empty.
pub fn mark_failed(
    conn: &Connection,
    job_id: i64,
    from: FailFrom<'_>,
    error_message: &str,
) -> Result<(), TransitionError> {
    let message = match error_message.trim() {
        "" => UNKNOWN_FAILURE,
        m => m,
    };
    let now = Utc::now();

    let changed = match from {
        FailFrom::Pending => conn.execute(
            "UPDATE jobs SET status = 'failed', finished_at = ?1, error_message = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![now, message, job_id],
        )?,
        FailFrom::Running(lease) => {
            if lease.job_id != job_id {
                return Err(TransitionError::LeaseLost(job_id));
            }
            conn.execute(
                "UPDATE jobs SET status = 'failed', finished_at = ?1, error_message = ?2,
                        lease_token = NULL, lease_expires_at = NULL
                 WHERE id = ?3 AND status = 'running' AND lease_token = ?4",
                params![now, message, job_id, lease.token],
            )?
        }
    };

    if changed == 0 {
        return Err(match from {
            FailFrom::Pending => rejected(conn, job_id, JobStatus::Failed)?,
            FailFrom::Running(_) => lease_rejected(conn, job_id, JobStatus::Failed)?,
        });
    }
    Ok(())
}

/// Outcome of one reconciliation pass over expired leases.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Moved back to `pending`; the caller re-enqueues them.
    pub requeued: Vec<i64>,
    /// Out of attempts; now `failed`.
    pub failed: Vec<i64>,
}

/// Reclaims `running` jobs whose lease expired at or before `now`.
pub fn reclaim_expired(
    conn: &Connection,
    now: DateTime<Utc>,
    max_attempts: i64,
) -> Result<Reclaimed, TransitionError> {
    let mut reclaimed = Reclaimed::default();

    for stale in job::find_expired_leases(conn, now.timestamp_millis())? {
        let Some(token) = stale.lease_token.as_deref() else {
            continue;
        };

        if stale.attempts >= max_attempts {
            let message = format!(
                "worker lease expired after {} attempt(s); giving up",
                stale.attempts
            );
            let changed = conn.execute(
                "UPDATE jobs SET status = 'failed', finished_at = ?1, error_message = ?2,
                        lease_token = NULL, lease_expires_at = NULL
                 WHERE id = ?3 AND status = 'running' AND lease_token = ?4",
                params![now, message, stale.id, token],
            )?;
            if changed > 0 {
                reclaimed.failed.push(stale.id);
            }
        } else {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'pending', started_at = NULL, lease_token = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND status = 'running' AND lease_token = ?2",
                params![stale.id, token],
            )?;
            if changed > 0 {
                reclaimed.requeued.push(stale.id);
            }
        }
    }

    Ok(reclaimed)
}

fn current_status(conn: &Connection, job_id: i64) -> Result<JobStatus, TransitionError> {
    job::find_by_id(conn, job_id)?
        .map(|j| j.status)
        .ok_or(TransitionError::NotFound(job_id))
}

fn rejected(conn: &Connection, job_id: i64, to: JobStatus) -> Result<TransitionError, TransitionError> {
    let from = current_status(conn, job_id)?;
    Ok(TransitionError::IllegalTransition { job_id, from, to })
}

/// A lease-guarded update matched nothing: either the job is not running at
/// all, or it is running under somebody else's lease.
fn lease_rejected(conn: &Connection, job_id: i64, to: JobStatus) -> Result<TransitionError, TransitionError> {
    match current_status(conn, job_id)? {
        JobStatus::Running => Ok(TransitionError::LeaseLost(job_id)),
        from => Ok(TransitionError::IllegalTransition { job_id, from, to }),
    }
}
