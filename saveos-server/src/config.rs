use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub repos_dir: PathBuf,
    pub public_url: String,
    pub log_level: String,
    pub borg_binary: String,
    pub default_passphrase: Option<String>,
    pub archive_simulation: bool,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub job_timeout: Duration,
    pub lease_ttl: Duration,
    pub max_job_attempts: i64,
    pub reconcile_cron: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));
        let mut config = Self::with_data_dir(data_dir);

        if let Some(port) = env_parse("PORT") {
            config.port = port;
        }
        if let Ok(dir) = std::env::var("REPOS_DIR") {
            config.repos_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("PUBLIC_URL") {
            config.public_url = url;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(binary) = std::env::var("BORG_BINARY") {
            config.borg_binary = binary;
        }
        config.default_passphrase = std::env::var("BORG_DEFAULT_PASSPHRASE")
            .ok()
            .filter(|p| !p.is_empty());
        if let Some(simulate) = env_parse("ARCHIVE_SIMULATION") {
            config.archive_simulation = simulate;
        }
        if let Some(workers) = env_parse("WORKER_COUNT") {
            config.worker_count = workers;
        }
        if let Some(capacity) = env_parse("QUEUE_CAPACITY") {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = env_parse("JOB_TIMEOUT_SECS") {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("LEASE_TTL_SECS") {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse("MAX_JOB_ATTEMPTS") {
            config.max_job_attempts = attempts;
        }
        if let Ok(cron) = std::env::var("RECONCILE_CRON") {
            config.reconcile_cron = cron;
        }

        config
    }

    /// Defaults rooted at `data_dir`, without reading the environment.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            port: 8000,
            db_path: data_dir.join("saveos.db"),
            repos_dir: data_dir.join("repos"),
            data_dir,
            public_url: "https://localhost:8000".into(),
            log_level: "info".into(),
            borg_binary: "borg".into(),
            default_passphrase: None,
            archive_simulation: false,
            worker_count: 2,
            queue_capacity: 256,
            job_timeout: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(300),
            max_job_attempts: 3,
            reconcile_cron: "0 * * * * *".into(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
