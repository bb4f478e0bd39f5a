use crate::archive::CommandRunner;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::services::dispatcher::Dispatcher;
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub dispatcher: Dispatcher,
    /// Runs archive tool commands for the workers.
    pub archive: Arc<dyn CommandRunner>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        dispatcher: Dispatcher,
        archive: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            db,
            config,
            dispatcher,
            archive,
        }
    }
}
