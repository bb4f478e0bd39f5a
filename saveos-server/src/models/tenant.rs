use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

pub const DEFAULT_TENANT: &str = "default";
pub const DEFAULT_QUOTA_BYTES: i64 = 10_000_000_000;

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    /// Declared storage quota. Not enforced when jobs are created.
    pub quota_bytes: i64,
    pub retention_policy: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn row_to_tenant(row: &Row) -> rusqlite::Result<Tenant> {
    let policy: String = row.get("retention_policy")?;
    Ok(Tenant {
        id: row.get("id")?,
        name: row.get("name")?,
        quota_bytes: row.get("quota_bytes")?,
        retention_policy: serde_json::from_str(&policy).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at")?,
    })
}

pub fn find_by_name(conn: &Connection, name: &str) -> anyhow::Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            "SELECT * FROM tenants WHERE name = ?",
            params![name],
            row_to_tenant,
        )
        .optional()?;
    Ok(tenant)
}

/// Returns the default tenant, creating it on first use.
pub fn find_or_create_default(conn: &Connection) -> anyhow::Result<Tenant> {
    conn.execute(
        "INSERT INTO tenants (name, quota_bytes, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![DEFAULT_TENANT, DEFAULT_QUOTA_BYTES, Utc::now()],
    )?;
    find_by_name(conn, DEFAULT_TENANT)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve default tenant"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[test]
    fn default_tenant_is_created_once() {
        let (_dir, pool) = test_pool();
        let conn = pool.get().unwrap();

        let first = find_or_create_default(&conn).unwrap();
        let second = find_or_create_default(&conn).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.quota_bytes, DEFAULT_QUOTA_BYTES);
        assert_eq!(first.retention_policy["daily"], 30);
    }
}
