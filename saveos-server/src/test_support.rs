use rusqlite::Connection;
use std::sync::Arc;
use tempfile::TempDir;

use crate::archive::ScriptedRunner;
use crate::config::AppConfig;
use crate::db::{self, DbPool};
use crate::models::agent::{self, Agent, AgentStatus, NewAgent};
use crate::models::tenant;
use crate::services::dispatcher::{Dispatcher, TaskReceiver};
use crate::services::token;
use crate::state::AppState;

/// A migrated database in a fresh temp dir. Keep the `TempDir` alive for the
/// duration of the test.
pub(crate) fn test_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::create_pool(&dir.path().join("test.db")).unwrap();
    db::migrate(&pool).unwrap();
    (dir, pool)
}

/// An active agent under the default tenant with a throwaway token.
pub(crate) fn seed_agent(conn: &Connection, hostname: &str) -> Agent {
    let tenant = tenant::find_or_create_default(conn).unwrap();
    let issued = token::issue();
    agent::create(
        conn,
        &NewAgent {
            tenant_id: tenant.id,
            hostname,
            platform: "linux",
            token_hash: &issued.hash,
            status: AgentStatus::Active,
            config: None,
        },
    )
    .unwrap()
}

/// Application state over a scratch data dir, with `runner` standing in for
/// the archive tool. Nothing consumes the returned queue unless the test
/// starts workers on it.
pub(crate) fn test_state(runner: Arc<ScriptedRunner>) -> (TempDir, Arc<AppState>, TaskReceiver) {
    test_state_with(runner, |_| {})
}

/// Like [`test_state`], with `configure` applied to the config first.
pub(crate) fn test_state_with(
    runner: Arc<ScriptedRunner>,
    configure: impl FnOnce(&mut AppConfig),
) -> (TempDir, Arc<AppState>, TaskReceiver) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::with_data_dir(dir.path().to_path_buf());
    config.default_passphrase = Some("test-passphrase".into());
    configure(&mut config);

    let pool = db::create_pool(&config.db_path).unwrap();
    db::migrate(&pool).unwrap();
    let (dispatcher, rx) = Dispatcher::new(config.queue_capacity);
    let state = Arc::new(AppState::new(pool, config, dispatcher, runner));
    (dir, state, rx)
}
