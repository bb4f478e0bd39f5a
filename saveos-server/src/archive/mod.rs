//! Adapter around the deduplicating archive tool (`borg`).
//!
//! Every operation is a subprocess call made through a [`CommandRunner`], so
//! tests can swap in a [`ScriptedRunner`]. Dropping an operation's future
//! stops the command it is running.

pub mod runner;
pub mod stats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use runner::{CommandRunner, Invocation, ProcessOutput, ScriptedRunner, SystemRunner};
pub use stats::{parse_size, parse_stats, BackupStats};

/// How many trailing lines of diagnostics to keep in error messages.
const DIAGNOSTIC_TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare repository directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {operation} failed ({}): {diagnostics}", exit_label(*status))]
    Execution {
        operation: &'static str,
        status: Option<i32>,
        diagnostics: String,
    },

    #[error("malformed archive listing: {0}")]
    MalformedListing(String),

    #[error("no source paths given")]
    NoSources,

    #[error("invalid source path {0:?}: must not start with '-'")]
    InvalidSource(String),
}

fn exit_label(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn diagnostics(output: &ProcessOutput) -> String {
    let text = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "no diagnostic output".to_string()
    } else {
        tail
    }
}

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub archive_name: String,
    pub stats: BackupStats,
    pub diagnostics: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

/// Archives in a repository. When the tool exits non-zero the list is empty
/// and `diagnostics` carries its output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveListing {
    pub archives: Vec<ArchiveEntry>,
    pub diagnostics: Option<String>,
}

#[derive(Deserialize)]
struct ListPayload {
    #[serde(default)]
    archives: Vec<ArchiveEntry>,
}

/// `{hostname}_{YYYYmmdd_HHMMSS}`; unique per host at one-second resolution.
pub fn archive_name(hostname: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", hostname, at.format("%Y%m%d_%H%M%S"))
}

/// One archive repository on local disk.
#[derive(Clone)]
pub struct BorgRepository {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    path: PathBuf,
    passphrase: Option<String>,
}

impl BorgRepository {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<String>,
        path: impl Into<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            path: path.into(),
            passphrase,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_arg(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn invocation(&self, args: Vec<String>) -> Invocation {
        let mut env = vec![
            ("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".to_string(), "yes".to_string()),
            ("BORG_RELOCATED_REPO_ACCESS_IS_OK".to_string(), "yes".to_string()),
        ];
        if let Some(passphrase) = &self.passphrase {
            env.push(("BORG_PASSPHRASE".to_string(), passphrase.clone()));
        }
        Invocation {
            program: self.binary.clone(),
            args,
            env,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<ProcessOutput, ArchiveError> {
        let invocation = self.invocation(args);
        tracing::debug!(?invocation, "Running archive command");
        self.runner.run(&invocation).await.map_err(|source| ArchiveError::Spawn {
            program: self.binary.clone(),
            source,
        })
    }

    /// Initializes the repository with key-based encryption unless it already
    /// exists. Returns `true` when this call created it.
    pub async fn ensure_repository(&self) -> Result<bool, ArchiveError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|source| ArchiveError::Io {
                path: self.path.clone(),
                source,
            })?;
        if exists {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ArchiveError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let output = self
            .run(vec![
                "init".into(),
                "--encryption=repokey".into(),
                "--".into(),
                self.path_arg(),
            ])
            .await?;
        if !output.success() {
            return Err(ArchiveError::Execution {
                operation: "init",
                status: output.status,
                diagnostics: diagnostics(&output),
            });
        }

        tracing::info!(repo = %self.path.display(), "Archive repository initialized");
        Ok(true)
    }

    /// Creates archive `name` from `sources`. Statistics that cannot be
    /// parsed are left unset rather than failing the backup.
    ///
    /// Sources come from agents, so everything after the options goes behind
    /// `--` and a source that looks like an option is refused outright.
    pub async fn create_backup(&self, sources: &[String], name: &str) -> Result<BackupOutcome, ArchiveError> {
        if sources.is_empty() {
            return Err(ArchiveError::NoSources);
        }
        if let Some(bad) = sources.iter().find(|s| s.starts_with('-')) {
            return Err(ArchiveError::InvalidSource(bad.clone()));
        }

        let mut args = vec![
            "create".to_string(),
            "--stats".to_string(),
            "--progress".to_string(),
            "--".to_string(),
            format!("{}::{}", self.path_arg(), name),
        ];
        args.extend(sources.iter().cloned());

        let output = self.run(args).await?;
        if !output.success() {
            return Err(ArchiveError::Execution {
                operation: "create",
                status: output.status,
                diagnostics: diagnostics(&output),
            });
        }

        let stats = parse_stats(&output.stderr);
        if stats == BackupStats::default() {
            tracing::warn!(archive = %name, "Archive tool reported no parseable statistics");
        }

        Ok(BackupOutcome {
            archive_name: name.to_string(),
            stats,
            diagnostics: output.stderr,
        })
    }

    pub async fn list_archives(&self) -> Result<ArchiveListing, ArchiveError> {
        let output = self
            .run(vec!["list".into(), "--json".into(), "--".into(), self.path_arg()])
            .await?;
        if !output.success() {
            return Ok(ArchiveListing {
                archives: Vec::new(),
                diagnostics: Some(diagnostics(&output)),
            });
        }

        let payload: ListPayload = serde_json::from_str(&output.stdout)
            .map_err(|e| ArchiveError::MalformedListing(e.to_string()))?;
        Ok(ArchiveListing {
            archives: payload.archives,
            diagnostics: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo_in(dir: &Path, runner: Arc<ScriptedRunner>) -> BorgRepository {
        BorgRepository::new(runner, "borg", dir.join("repos/h1"), Some("secret".into()))
    }

    #[test]
    fn archive_names_embed_host_and_second() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(archive_name("h1", at), "h1_20240309_070501");
    }

    #[tokio::test]
    async fn ensure_repository_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::simulated());
        let repo = repo_in(dir.path(), runner.clone());

        assert!(repo.ensure_repository().await.unwrap());
        assert!(!repo.ensure_repository().await.unwrap());
        assert_eq!(runner.subcommands(), vec!["init"]);

        let init = &runner.calls()[0];
        assert_eq!(init.args[1], "--encryption=repokey");
        assert!(init
            .env
            .contains(&("BORG_PASSPHRASE".to_string(), "secret".to_string())));
        assert!(init
            .env
            .contains(&("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".to_string(), "yes".to_string())));
    }

    #[tokio::test]
    async fn init_failure_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_exit(2, "Repository already exists elsewhere");
        let repo = repo_in(dir.path(), runner);

        let err = repo.ensure_repository().await.unwrap_err();
        assert!(matches!(err, ArchiveError::Execution { operation: "init", status: Some(2), .. }));
        assert!(err.to_string().contains("already exists elsewhere"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_spawn_error(std::io::ErrorKind::NotFound);
        let repo = repo_in(dir.path(), runner);

        assert!(matches!(repo.ensure_repository().await, Err(ArchiveError::Spawn { .. })));
    }

    #[tokio::test]
    async fn create_passes_archive_target_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("", "Original size: 2 KB\nCompressed size: 1 KB\nDeduplicated size: 512 B\n");
        let repo = repo_in(dir.path(), runner.clone());

        let outcome = repo
            .create_backup(&["/etc".into(), "/home".into()], "h1_20240101_000000")
            .await
            .unwrap();

        assert_eq!(outcome.stats.compressed_size, Some(1024));
        let call = &runner.calls()[0];
        assert_eq!(call.args[..4], ["create", "--stats", "--progress", "--"]);
        assert!(call.args[4].ends_with("repos/h1::h1_20240101_000000"));
        assert_eq!(call.args[5..], ["/etc", "/home"]);
    }

    #[tokio::test]
    async fn option_like_sources_are_refused_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::simulated());
        let repo = repo_in(dir.path(), runner.clone());

        let sources: Vec<String> = ["--content-from-command", "--", "sh", "-c", "id"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = repo.create_backup(&sources, "x").await.unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidSource(ref s) if s == "--content-from-command"));

        let err = repo
            .create_backup(&["/etc".into(), "--exclude-from=/etc/shadow".into()], "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidSource(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn create_with_unparseable_stats_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("", "done\n");
        let repo = repo_in(dir.path(), runner);

        let outcome = repo.create_backup(&["/data".into()], "x").await.unwrap();
        assert_eq!(outcome.stats, BackupStats::default());
    }

    #[tokio::test]
    async fn create_failure_reports_exit_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_exit(2, "line\n/data: [Errno 2] No such file or directory");
        let repo = repo_in(dir.path(), runner);

        let err = repo.create_backup(&["/data".into()], "x").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 2"));
        assert!(message.contains("No such file or directory"));
    }

    #[tokio::test]
    async fn create_requires_sources() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo_in(dir.path(), Arc::new(ScriptedRunner::new()));
        assert!(matches!(repo.create_backup(&[], "x").await, Err(ArchiveError::NoSources)));
    }

    #[tokio::test]
    async fn list_parses_archives() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok(
            r#"{"archives":[{"name":"h1_20240101_000000","id":"abc","start":"2024-01-01T00:00:00.000000"}],"repository":{}}"#,
            "",
        );
        let repo = repo_in(dir.path(), runner);

        let listing = repo.list_archives().await.unwrap();
        assert_eq!(listing.archives.len(), 1);
        assert_eq!(listing.archives[0].id.as_deref(), Some("abc"));
        assert!(listing.diagnostics.is_none());
    }

    #[tokio::test]
    async fn list_failure_yields_empty_listing_with_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_exit(2, "Repository does not exist");
        let repo = repo_in(dir.path(), runner);

        let listing = repo.list_archives().await.unwrap();
        assert!(listing.archives.is_empty());
        assert_eq!(listing.diagnostics.as_deref(), Some("Repository does not exist"));
    }

    #[tokio::test]
    async fn malformed_listing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_ok("not json", "");
        let repo = repo_in(dir.path(), runner);

        assert!(matches!(repo.list_archives().await, Err(ArchiveError::MalformedListing(_))));
    }
}
