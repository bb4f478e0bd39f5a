use crate::db::connection::DbPool;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  quota_bytes INTEGER NOT NULL DEFAULT 10000000000,
  retention_policy TEXT NOT NULL DEFAULT '{"daily":30,"weekly":12,"monthly":12}',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id INTEGER NOT NULL REFERENCES tenants(id),
  hostname TEXT NOT NULL,
  platform TEXT NOT NULL DEFAULT '',
  token_hash TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','inactive','error')),
  last_seen TEXT NOT NULL,
  config TEXT,
  created_at TEXT NOT NULL,
  UNIQUE(tenant_id, hostname)
);

CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent_id INTEGER NOT NULL REFERENCES agents(id),
  type TEXT NOT NULL CHECK(type IN ('backup','restore','check')),
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','completed','failed')),
  started_at TEXT,
  finished_at TEXT,
  error_message TEXT,
  config TEXT,
  lease_token TEXT,
  lease_expires_at INTEGER,
  attempts INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id INTEGER NOT NULL UNIQUE REFERENCES jobs(id),
  name TEXT NOT NULL,
  repo_path TEXT NOT NULL,
  size_bytes INTEGER,
  original_size_bytes INTEGER,
  deduplicated_size_bytes INTEGER,
  is_full INTEGER NOT NULL DEFAULT 1,
  checksum TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_agent_id ON jobs(agent_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_snapshots_created_at ON snapshots(created_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent column additions for databases created before leases existed
    if !has_column(&conn, "jobs", "lease_token")? {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN lease_token TEXT")?;
    }
    if !has_column(&conn, "jobs", "lease_expires_at")? {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN lease_expires_at INTEGER")?;
    }
    if !has_column(&conn, "jobs", "attempts")? {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();

        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        assert!(has_column(&conn, "jobs", "lease_token").unwrap());
        assert!(!has_column(&conn, "jobs", "snapshot_id").unwrap());
    }

    #[test]
    fn schema_quota_default_matches_the_default_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO tenants (name, created_at) VALUES ('other', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let quota: i64 = conn
            .query_row("SELECT quota_bytes FROM tenants WHERE name = 'other'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(quota, crate::models::tenant::DEFAULT_QUOTA_BYTES);
    }
}
