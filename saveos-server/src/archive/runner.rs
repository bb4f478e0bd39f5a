use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

/// One external program call: binary, arguments and extra environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// The archive subcommand, e.g. `init` or `create`.
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

// Environment values carry the repository passphrase.
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &keys)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs archive tool commands. Dropping the returned future must stop the
/// command: a timed-out job cannot leave the tool holding the repository.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<ProcessOutput>;
}

/// Spawns real processes. The child is killed if the call is dropped.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<ProcessOutput> {
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Canned stderr of a successful `create --stats`.
pub const SIMULATED_CREATE_STATS: &str = "\
------------------------------------------------------------------------------
Archive name: simulated
Number of files: 42
                       Original size      Compressed size    Deduplicated size
This archive:                 10.50 MB              4.20 MB              1.10 MB
All archives:                 10.50 MB              4.20 MB              1.10 MB
------------------------------------------------------------------------------
";

/// Answers invocations from a queue of prepared responses instead of
/// spawning processes, and records every call it receives.
///
/// A successful `init` also creates the repository directory so later
/// existence checks see it, mirroring what the real tool does.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<Scripted>>,
    fallback: Option<ProcessOutput>,
    calls: Mutex<Vec<Invocation>>,
    finished: Mutex<Vec<Invocation>>,
}

struct Scripted {
    delay: Duration,
    result: std::io::Result<ProcessOutput>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner for which every command succeeds. `create` reports
    /// [`SIMULATED_CREATE_STATS`]; `list` reports no archives.
    pub fn simulated() -> Self {
        Self {
            fallback: Some(ProcessOutput {
                status: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }),
            ..Self::default()
        }
    }

    /// Queues the next response.
    pub fn push(&self, output: ProcessOutput) -> &Self {
        self.push_delayed(Duration::ZERO, output)
    }

    /// Queues a response that takes `delay` to arrive, like a long-running
    /// command.
    pub fn push_delayed(&self, delay: Duration, output: ProcessOutput) -> &Self {
        self.lock_responses().push_back(Scripted {
            delay,
            result: Ok(output),
        });
        self
    }

    pub fn push_ok(&self, stdout: &str, stderr: &str) -> &Self {
        self.push(ProcessOutput {
            status: Some(0),
            stdout: stdout.into(),
            stderr: stderr.into(),
        })
    }

    pub fn push_exit(&self, code: i32, stderr: &str) -> &Self {
        self.push(ProcessOutput {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        })
    }

    /// Queues a spawn failure, as when the binary is missing.
    pub fn push_spawn_error(&self, kind: std::io::ErrorKind) -> &Self {
        self.lock_responses().push_back(Scripted {
            delay: Duration::ZERO,
            result: Err(std::io::Error::new(kind, "scripted spawn failure")),
        });
        self
    }

    /// Every invocation received, including ones still in flight.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Invocations that ran to completion; a dropped call never lands here.
    pub fn finished(&self) -> Vec<Invocation> {
        self.finished.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn subcommands(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.subcommand().map(str::to_string))
            .collect()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.responses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn simulate(&self, invocation: &Invocation, base: &ProcessOutput) -> ProcessOutput {
        let mut out = base.clone();
        match invocation.subcommand() {
            Some("create") => out.stderr = SIMULATED_CREATE_STATS.to_string(),
            Some("list") => out.stdout = r#"{"archives": []}"#.to_string(),
            _ => {}
        }
        out
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<ProcessOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }

        let next = self.lock_responses().pop_front();
        let output = match next {
            Some(Scripted { delay, result }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result?
            }
            None => match &self.fallback {
                Some(base) => self.simulate(invocation, base),
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("no scripted response for {:?}", invocation.subcommand()),
                    ))
                }
            },
        };

        if output.success() && invocation.subcommand() == Some("init") {
            if let Some(repo) = invocation.args.last() {
                tokio::fs::create_dir_all(repo).await?;
            }
        }
        if let Ok(mut finished) = self.finished.lock() {
            finished.push(invocation.clone());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(args: &[&str]) -> Invocation {
        Invocation {
            program: "borg".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec![("BORG_PASSPHRASE".into(), "hunter2".into())],
        }
    }

    #[test]
    fn debug_output_hides_environment_values() {
        let rendered = format!("{:?}", invocation(&["list", "--json", "/r"]));
        assert!(rendered.contains("BORG_PASSPHRASE"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn scripted_runner_replays_in_order_and_records_calls() {
        let runner = ScriptedRunner::new();
        runner.push_ok("first", "").push_exit(2, "boom");

        let a = runner.run(&invocation(&["create"])).await.unwrap();
        let b = runner.run(&invocation(&["list"])).await.unwrap();
        assert_eq!(a.stdout, "first");
        assert!(a.success());
        assert_eq!(b.status, Some(2));
        assert_eq!(runner.subcommands(), vec!["create", "list"]);

        assert!(runner.run(&invocation(&["list"])).await.is_err());
    }

    #[tokio::test]
    async fn scripted_init_creates_the_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("a/repo");
        let runner = ScriptedRunner::simulated();

        runner
            .run(&invocation(&["init", "--encryption=repokey", repo.to_str().unwrap()]))
            .await
            .unwrap();
        assert!(repo.is_dir());
    }

    #[tokio::test]
    async fn spawn_errors_surface_as_io_errors() {
        let runner = ScriptedRunner::new();
        runner.push_spawn_error(std::io::ErrorKind::NotFound);
        let err = runner.run(&invocation(&["init"])).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn dropped_scripted_call_never_finishes() {
        let runner = ScriptedRunner::new();
        runner.push_delayed(Duration::from_secs(5), ProcessOutput::default());

        let call = invocation(&["create"]);
        let result = tokio::time::timeout(Duration::from_millis(50), runner.run(&call)).await;
        assert!(result.is_err());
        assert_eq!(runner.calls().len(), 1);
        assert!(runner.finished().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_exit_status_and_output() {
        let out = SystemRunner
            .run(&Invocation {
                program: "sh".into(),
                args: vec!["-c".into(), "echo out; echo err >&2; exit 3".into()],
                env: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_kills_the_child_when_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch '{}'", marker.display());
        let call = Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), script],
            env: Vec::new(),
        };

        let result = tokio::time::timeout(Duration::from_millis(100), SystemRunner.run(&call)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
