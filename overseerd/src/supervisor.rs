//! Typed process supervision.
//!
//! The supervisor only runs operations from the closed [`CommandKind`] set.
//! Scripts come from repo configuration and are substituted into fixed
//! command templates; no caller-supplied shell line is ever executed.
//! A running operation is observed through an [`ExecutionHandle`]: an
//! ordered log stream, a cancellation trigger, and a terminal future that
//! yields the exit outcome exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

use overseer_common::envelope::{CommandKind, CommandParams, LogRecord, LogStream};
use overseer_common::error::{RunnerError, RunnerResult};

use crate::config::{RepoScripts, RunnerConfig};
use crate::journal::ExecutionJournal;
use crate::process_registry::{
    load_registry, save_registry, ProcessRecord, ProcessStatus, Registry,
};
use crate::process_utils::read_proc_stat;

/// What to feed the child's stdin.
#[derive(Clone, Debug, PartialEq)]
pub enum StdinPolicy {
    Closed,
    /// Write the payload, then close. Used for coding-agent prompts.
    Payload(String),
}

/// A fully resolved operation, ready to spawn.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationPlan {
    pub kind: CommandKind,
    pub program: String,
    pub args: Vec<String>,
    pub stdin: StdinPolicy,
}

/// Resolve a typed operation against repo scripts and executor profiles.
pub fn plan_operation(
    kind: CommandKind,
    params: &CommandParams,
    scripts: &RepoScripts,
    config: &RunnerConfig,
) -> RunnerResult<OperationPlan> {
    let shell = |body: &str| OperationPlan {
        kind,
        program: "bash".to_string(),
        args: vec!["-c".to_string(), body.to_string()],
        stdin: StdinPolicy::Closed,
    };
    let missing = |what: &str| {
        RunnerError::fatal(format!(
            "repo configuration has no {what} for {}",
            kind.as_str()
        ))
    };

    match (kind, params) {
        (CommandKind::RunSetupScript, CommandParams::Script(p)) => {
            let script = scripts
                .setup_script(&p.script)
                .ok_or_else(|| missing(&format!("setup script '{}'", p.script)))?;
            Ok(shell(&script.run))
        }
        (CommandKind::RunCleanupScript, CommandParams::Script(_)) => {
            let body = scripts.cleanup.as_deref().ok_or_else(|| missing("cleanup script"))?;
            Ok(shell(body))
        }
        (CommandKind::RunArchiveScript, CommandParams::Script(_)) => {
            let body = scripts.archive.as_deref().ok_or_else(|| missing("archive script"))?;
            Ok(shell(body))
        }
        (CommandKind::RunDevServer, CommandParams::Script(_)) => {
            let body = scripts
                .dev_server
                .as_deref()
                .ok_or_else(|| missing("dev server command"))?;
            Ok(shell(body))
        }
        (CommandKind::RunCodingAgent, CommandParams::CodingAgent(p)) => {
            let name = p
                .executor
                .as_deref()
                .or(config.default_executor.as_deref())
                .ok_or_else(|| RunnerError::fatal("no executor requested or configured"))?;
            let profile = config
                .executors
                .get(name)
                .ok_or_else(|| RunnerError::fatal(format!("unknown executor profile '{name}'")))?;
            Ok(OperationPlan {
                kind,
                program: profile.program.clone(),
                args: profile.args.clone(),
                stdin: StdinPolicy::Payload(p.prompt.clone()),
            })
        }
        (CommandKind::GitCommit, CommandParams::GitCommit(p)) => Ok(OperationPlan {
            kind,
            program: "git".into(),
            args: vec!["commit".into(), "--all".into(), "--message".into(), p.message.clone()],
            stdin: StdinPolicy::Closed,
        }),
        (CommandKind::GitPush, CommandParams::GitPush(p)) => Ok(OperationPlan {
            kind,
            program: "git".into(),
            args: vec![
                "push".into(),
                p.remote.clone().unwrap_or_else(|| "origin".into()),
                "HEAD".into(),
            ],
            stdin: StdinPolicy::Closed,
        }),
        (CommandKind::OpenPr, CommandParams::OpenPr(p)) => {
            let mut args = vec![
                "pr".to_string(),
                "create".to_string(),
                "--title".to_string(),
                p.title.clone(),
                "--body".to_string(),
                p.body.clone().unwrap_or_default(),
            ];
            if let Some(base) = &p.base {
                args.push("--base".into());
                args.push(base.clone());
            }
            Ok(OperationPlan {
                kind,
                program: config.host_cli.clone(),
                args,
                stdin: StdinPolicy::Closed,
            })
        }
        (CommandKind::AttachPr, CommandParams::AttachPr(p)) => Ok(OperationPlan {
            kind,
            program: config.host_cli.clone(),
            args: vec!["pr".into(), "view".into(), p.pr_number.to_string()],
            stdin: StdinPolicy::Closed,
        }),
        (CommandKind::TerminalSession, CommandParams::TerminalSession) => Ok(OperationPlan {
            kind,
            program: "bash".into(),
            args: vec!["-i".into()],
            stdin: StdinPolicy::Closed,
        }),
        _ => Err(RunnerError::fatal(format!(
            "parameter object does not match {}",
            kind.as_str()
        ))),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Cloneable cancellation trigger for a supervised process.
#[derive(Clone)]
pub struct CancelTrigger(Arc<watch::Sender<bool>>);

impl CancelTrigger {
    /// Request graceful termination; escalates to SIGKILL after the grace
    /// period. Safe to fire more than once.
    pub fn fire(&self) {
        let _ = self.0.send(true);
    }
}

pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub pid: Option<u32>,
    logs: Option<mpsc::UnboundedReceiver<LogRecord>>,
    cancel: CancelTrigger,
    exit: oneshot::Receiver<ExitOutcome>,
}

impl ExecutionHandle {
    /// Request graceful termination; escalates to SIGKILL after the grace
    /// period. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.fire();
    }

    /// A trigger that outlives [`Self::wait`].
    pub fn cancel_trigger(&self) -> CancelTrigger {
        self.cancel.clone()
    }

    /// The ordered log stream. Can be taken once.
    pub fn take_logs(&mut self) -> Option<mpsc::UnboundedReceiver<LogRecord>> {
        self.logs.take()
    }

    /// Await the terminal exit. Reported exactly once.
    pub async fn wait(self) -> RunnerResult<ExitOutcome> {
        self.exit
            .await
            .map_err(|_| RunnerError::fatal("supervisor task dropped before exit report"))
    }
}

pub struct Supervisor {
    managed_root: PathBuf,
    cancel_grace: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl Supervisor {
    pub fn new(managed_root: PathBuf, cancel_grace: Duration) -> Self {
        let registry = load_registry(&managed_root).unwrap_or_else(|err| {
            warn!("failed to load process registry: {err}");
            Registry::new()
        });
        Self {
            managed_root,
            cancel_grace,
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<Registry>> {
        self.registry.clone()
    }

    async fn persist_registry(&self) {
        let snapshot = self.registry.lock().await.clone();
        let root = self.managed_root.clone();
        match task::spawn_blocking(move || save_registry(&root, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to persist process registry: {err}"),
            Err(err) => warn!("registry persist task panicked: {err}"),
        }
    }

    /// Spawn the planned operation and supervise it to completion.
    pub async fn run(
        &self,
        execution_id: Uuid,
        plan: OperationPlan,
        env: &[(String, String)],
        cwd: &Path,
        journal: Arc<ExecutionJournal>,
    ) -> RunnerResult<ExecutionHandle> {
        let mut command = TokioCommand::new(&plan.program);
        command
            .args(&plan.args)
            .current_dir(cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }
        match &plan.stdin {
            StdinPolicy::Closed => {
                command.stdin(std::process::Stdio::null());
            }
            StdinPolicy::Payload(_) => {
                command.stdin(std::process::Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|e| {
            RunnerError::io(format!("spawn {} {}", plan.program, plan.args.join(" ")), e)
        })?;
        let pid = child.id();

        if let StdinPolicy::Payload(payload) = &plan.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let payload = payload.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(payload.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        if let Some(pid) = pid {
            let ticks = read_proc_stat(pid).map(|s| s.starttime).unwrap_or_default();
            self.registry.lock().await.insert(ProcessRecord {
                execution_id,
                pid,
                start_ticks: ticks,
                started_at: Utc::now(),
                command: format!("{} {}", plan.program, plan.args.join(" ")),
                status: ProcessStatus::Running,
                exit_code: None,
            });
            self.persist_registry().await;
        }

        let (log_tx, log_rx) = mpsc::unbounded_channel::<LogRecord>();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel::<ExitOutcome>();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = spawn_line_reader(stdout, LogStream::Stdout, journal.clone(), log_tx.clone());
        let err_task = spawn_line_reader(stderr, LogStream::Stderr, journal.clone(), log_tx.clone());
        drop(log_tx);

        let registry = self.registry.clone();
        let managed_root = self.managed_root.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            let outcome = supervise(child, pid, cancel_rx, grace).await;

            // Drain readers before the exit report so log ordering holds.
            if let Some(handle) = out_task {
                let _ = handle.await;
            }
            if let Some(handle) = err_task {
                let _ = handle.await;
            }

            let _ = journal.append_system(serde_json::json!({
                "event": "exit",
                "exit_code": outcome.exit_code,
                "cancelled": outcome.cancelled,
            }));
            if let Err(err) = journal.finalize() {
                warn!(execution_id = %execution_id, "journal finalize failed: {err}");
            }

            {
                let mut guard = registry.lock().await;
                guard.mark_exited(execution_id, outcome.exit_code);
                let snapshot = guard.clone();
                drop(guard);
                let _ = task::spawn_blocking(move || save_registry(&managed_root, &snapshot)).await;
            }

            // The oneshot enforces the exactly-once exit report.
            let _ = exit_tx.send(outcome);
        });

        debug!(execution_id = %execution_id, pid = ?pid, op = plan.kind.as_str(), "operation spawned");
        Ok(ExecutionHandle {
            execution_id,
            pid,
            logs: Some(log_rx),
            cancel: CancelTrigger(Arc::new(cancel_tx)),
            exit: exit_rx,
        })
    }
}

fn spawn_line_reader<R>(
    source: Option<R>,
    stream: LogStream,
    journal: Arc<ExecutionJournal>,
    log_tx: mpsc::UnboundedSender<LogRecord>,
) -> Option<task::JoinHandle<()>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let source = source?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match journal.append_bytes(stream, line) {
                Ok(record) => {
                    let _ = log_tx.send(record);
                }
                Err(err) => {
                    warn!("log append failed: {err}");
                    break;
                }
            }
        }
    }))
}

async fn supervise(
    mut child: tokio::process::Child,
    pid: Option<u32>,
    mut cancel_rx: watch::Receiver<bool>,
    grace: Duration,
) -> ExitOutcome {
    let mut cancel_closed = false;
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit_code = status.ok().and_then(|s| s.code());
                return ExitOutcome { exit_code, cancelled: false };
            }
            changed = cancel_rx.changed(), if !cancel_closed => {
                match changed {
                    // Handle dropped without cancelling; keep waiting.
                    Err(_) => cancel_closed = true,
                    Ok(()) if !*cancel_rx.borrow() => {}
                    Ok(()) => {
                        send_graceful_signal(pid);
                        let status = tokio::time::timeout(grace, child.wait()).await;
                        let exit_code = match status {
                            Ok(result) => result.ok().and_then(|s| s.code()),
                            Err(_) => {
                                let _ = child.kill().await;
                                None
                            }
                        };
                        return ExitOutcome { exit_code, cancelled: true };
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_graceful_signal(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorProfile;
    use serde_json::json;
    use tempfile::TempDir;

    fn plan_shell(body: &str) -> OperationPlan {
        OperationPlan {
            kind: CommandKind::RunSetupScript,
            program: "bash".into(),
            args: vec!["-c".into(), body.into()],
            stdin: StdinPolicy::Closed,
        }
    }

    fn supervisor(root: &TempDir) -> Supervisor {
        Supervisor::new(root.path().to_path_buf(), Duration::from_millis(200))
    }

    async fn collect_logs(mut rx: mpsc::UnboundedReceiver<LogRecord>) -> Vec<LogRecord> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn streams_logs_in_order_and_reports_exit() {
        let root = TempDir::new().unwrap();
        let sup = supervisor(&root);
        let id = Uuid::new_v4();
        let journal = Arc::new(ExecutionJournal::open(root.path(), id, 64 * 1024).unwrap());

        let mut handle = sup
            .run(
                id,
                plan_shell("echo one; echo two; echo oops >&2"),
                &[],
                root.path(),
                journal,
            )
            .await
            .unwrap();
        let logs = handle.take_logs().unwrap();
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.success());

        let records = collect_logs(logs).await;
        assert_eq!(records.len(), 3);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "delivery preserves production order");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nonzero_exit_is_reported() {
        let root = TempDir::new().unwrap();
        let sup = supervisor(&root);
        let id = Uuid::new_v4();
        let journal = Arc::new(ExecutionJournal::open(root.path(), id, 1024).unwrap());

        let handle = sup
            .run(id, plan_shell("exit 3"), &[], root.path(), journal)
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_terminates_with_grace() {
        let root = TempDir::new().unwrap();
        let sup = supervisor(&root);
        let id = Uuid::new_v4();
        let journal = Arc::new(ExecutionJournal::open(root.path(), id, 1024).unwrap());

        let handle = sup
            .run(id, plan_shell("sleep 30"), &[], root.path(), journal)
            .await
            .unwrap();
        handle.cancel();
        handle.cancel(); // idempotent
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn env_is_injected_and_stdin_payload_delivered() {
        let root = TempDir::new().unwrap();
        let sup = supervisor(&root);
        let id = Uuid::new_v4();
        let journal = Arc::new(ExecutionJournal::open(root.path(), id, 4096).unwrap());

        let plan = OperationPlan {
            kind: CommandKind::RunCodingAgent,
            program: "bash".into(),
            args: vec!["-c".into(), "read line; echo \"$VK_WORKSPACE_ID:$line\"".into()],
            stdin: StdinPolicy::Payload("hello agent\n".into()),
        };
        let mut handle = sup
            .run(
                id,
                plan,
                &[("VK_WORKSPACE_ID".into(), "ws-1".into())],
                root.path(),
                journal,
            )
            .await
            .unwrap();
        let logs = handle.take_logs().unwrap();
        assert!(handle.wait().await.unwrap().success());

        let records = collect_logs(logs).await;
        let text = match &records[0].payload {
            overseer_common::envelope::LogPayload::Bytes { bytes } => bytes.clone(),
            other => panic!("unexpected payload {other:?}"),
        };
        assert_eq!(text, "ws-1:hello agent");
    }

    #[test]
    fn coding_agent_plan_uses_executor_profile() {
        let mut config = RunnerConfig::default();
        config.executors.insert(
            "claude".into(),
            ExecutorProfile {
                program: "claude-agent".into(),
                args: vec!["--headless".into()],
            },
        );
        config.default_executor = Some("claude".into());

        let params = CommandParams::validate(
            CommandKind::RunCodingAgent,
            &json!({"prompt": "fix the bug"}),
        )
        .unwrap();
        let plan = plan_operation(
            CommandKind::RunCodingAgent,
            &params,
            &RepoScripts::default(),
            &config,
        )
        .unwrap();
        assert_eq!(plan.program, "claude-agent");
        assert_eq!(plan.stdin, StdinPolicy::Payload("fix the bug".into()));
    }

    #[test]
    fn scripts_resolve_from_repo_configuration_only() {
        let config = RunnerConfig::default();
        let scripts = RepoScripts::default();
        let params =
            CommandParams::validate(CommandKind::RunSetupScript, &json!({"script": "deps"}))
                .unwrap();
        // No configured script: the operation cannot be planned.
        assert!(plan_operation(CommandKind::RunSetupScript, &params, &scripts, &config).is_err());
    }
}
