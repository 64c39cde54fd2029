//! End-to-end scenarios: a real managed root, real git repositories, real
//! supervised processes, and the in-memory control-plane store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use overseer_common::envelope::{CommandKind, ExecutionIntent};
use overseer_common::types::{
    DeviceEnrollment, ExecutionStatus, QueuedMessageState, RepoSpec, RunReason, SessionStatus,
};
use overseer_store::{ControlPlaneStore, CreateWorkspace, MemoryStore};

use overseerd::config::{ExecutorProfile, RunnerConfig};
use overseerd::dispatch::DispatchClient;
use overseerd::git;
use overseerd::lease::LeaseManager;
use overseerd::orchestrator::Orchestrator;
use overseerd::supervisor::Supervisor;
use overseerd::worktree::WorktreeManager;

const DEVICE_KEY_B64: &str = "dGVzdC1kZXZpY2Uta2V5"; // "test-device-key"
const DEVICE_KEY: &[u8] = b"test-device-key";

/// An "agent" that reads its prompt from stdin, appends it to CHANGES.md,
/// and commits, producing a new HEAD.
const COMMIT_AGENT: &str =
    "read -r prompt; echo \"$prompt\" >> CHANGES.md; git add -A; git commit -q -m \"agent work\"";

/// Same agent, but slow enough to interact with while running.
const SLOW_COMMIT_AGENT: &str = "read -r prompt; sleep 0.6; \
     echo \"$prompt\" >> CHANGES.md; git add -A; git commit -q -m \"agent work\"";

struct Harness {
    _root: TempDir,
    _source: TempDir,
    managed_root: PathBuf,
    store: Arc<dyn ControlPlaneStore>,
    orchestrator: Arc<Orchestrator>,
    workspace_id: Uuid,
    session_id: Uuid,
    source_path: PathBuf,
}

fn init_source_repo(dir: &Path) {
    git::git(dir, &["init", "--initial-branch", "main"]).unwrap();
    git::git(dir, &["config", "user.email", "agent@example.com"]).unwrap();
    git::git(dir, &["config", "user.name", "Agent"]).unwrap();
    std::fs::write(dir.join("README.md"), "# app\n").unwrap();
    git::git(dir, &["add", "."]).unwrap();
    git::git(dir, &["commit", "-m", "init"]).unwrap();
}

async fn harness(agent_script: &str) -> Harness {
    harness_opts(agent_script, false).await
}

async fn harness_opts(agent_script: &str, remove_worktrees_on_archive: bool) -> Harness {
    let root = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    init_source_repo(source.path());

    let mut config = RunnerConfig::default();
    config.managed_root = Some(root.path().to_path_buf());
    config.archive.remove_worktrees = remove_worktrees_on_archive;
    config.device.id = "dev-1".into();
    config.device.key = DEVICE_KEY_B64.into();
    config.executors.insert(
        "test-agent".into(),
        ExecutorProfile {
            program: "bash".into(),
            args: vec!["-c".into(), agent_script.into()],
        },
    );
    config.default_executor = Some("test-agent".into());

    let managed_root = overseerd::config::resolve_managed_root(&config).unwrap();
    let store: Arc<dyn ControlPlaneStore> = Arc::new(MemoryStore::new());
    store
        .enroll_device(DeviceEnrollment {
            device_id: "dev-1".into(),
            owning_principal: "user-1".into(),
            public_key: DEVICE_KEY_B64.into(),
            revoked_at: None,
        })
        .await
        .unwrap();

    let (workspace, session) = store
        .create_workspace(CreateWorkspace {
            owner: "user-1".into(),
            org: None,
            project: None,
            name: "W1".into(),
            branch: "feat/x".into(),
            repos: vec![RepoSpec {
                repo_id: "host/app".into(),
                repo_name: "app".into(),
                target_branch: "main".into(),
                source_path: source.path().to_path_buf(),
                enabled: true,
                sort_order: 0,
            }],
            initial_session_title: Some("first".into()),
        })
        .await
        .unwrap();

    let config = Arc::new(config);
    let worktrees = Arc::new(WorktreeManager::new(
        managed_root.clone(),
        config.retry.budget(),
    ));
    let supervisor = Arc::new(Supervisor::new(
        managed_root.clone(),
        Duration::from_millis(500),
    ));
    let leases = LeaseManager::new(
        store.clone(),
        "dev-1".into(),
        Duration::from_secs(30),
        Duration::from_secs(10),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        worktrees,
        supervisor,
        leases,
        config,
    ));

    Harness {
        source_path: source.path().to_path_buf(),
        managed_root,
        store,
        orchestrator,
        workspace_id: workspace.id,
        session_id: session.id,
        _root: root,
        _source: source,
    }
}

fn coding_intent(h: &Harness, execution_id: Uuid, prompt: &str, nonce: &str) -> ExecutionIntent {
    let mut intent = ExecutionIntent {
        intent_id: Uuid::new_v4(),
        nonce: nonce.into(),
        target_device_id: "dev-1".into(),
        issued_at: Utc::now(),
        ttl_ms: 60_000,
        workspace_id: h.workspace_id,
        session_id: h.session_id,
        execution_id,
        run_reason: RunReason::CodingAgent,
        command_kind: CommandKind::RunCodingAgent,
        params: serde_json::json!({ "prompt": prompt }),
        principal: "user-1".into(),
        hmac: String::new(),
    };
    intent.sign(DEVICE_KEY).unwrap();
    intent
}

async fn wait_for<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_repo_happy_path() {
    let h = harness(COMMIT_AGENT).await;
    let main_sha = git::head_commit(&h.source_path).unwrap();

    assert_eq!(
        h.store.get_session(h.session_id).await.unwrap().status,
        SessionStatus::Idle
    );

    let execution = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, execution.id, "add a changelog", "n-s1");
    h.orchestrator.handle_intent(intent).await.unwrap();

    let done = h.store.get_execution(execution.id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(done.completed_at.is_some());

    // Session went idle -> running -> idle; final state is idle.
    assert_eq!(
        h.store.get_session(h.session_id).await.unwrap().status,
        SessionStatus::Idle
    );

    let states = h.store.get_repo_states(execution.id).await.unwrap();
    assert_eq!(states.len(), 1);
    let state = &states[0];
    assert_eq!(state.before_head_commit.as_deref(), Some(main_sha.as_str()));
    let after = state.after_head_commit.clone().unwrap();
    assert_ne!(after, main_sha, "the agent commit moved HEAD");

    assert!(h
        .store
        .get_queue_status(h.session_id)
        .await
        .unwrap()
        .is_none());

    let log_file = h
        .managed_root
        .join(".logs")
        .join(format!("{}.jsonl", execution.id));
    assert!(log_file.is_file(), "execution journal must exist");
    let records = overseerd::journal::replay(&log_file).unwrap();
    assert!(!records.is_empty());
}

// Follow-up while running: single queue slot, replacement, consumption.
#[tokio::test(flavor = "multi_thread")]
async fn follow_up_while_running() {
    let h = harness(SLOW_COMMIT_AGENT).await;

    let e1 = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, e1.id, "first task", "n-s2");
    let orchestrator = h.orchestrator.clone();
    let running = tokio::spawn(async move { orchestrator.handle_intent(intent).await });

    wait_for(
        || async {
            h.store.get_execution(e1.id).await.unwrap().status == ExecutionStatus::Running
        },
        "execution to start",
    )
    .await;

    h.store
        .enqueue_follow_up(h.session_id, "also update README".into(), None, None, None)
        .await
        .unwrap();
    let first = h.store.get_queue_status(h.session_id).await.unwrap().unwrap();
    assert_eq!(first.state, QueuedMessageState::Queued);
    assert_eq!(first.message, "also update README");

    h.store
        .enqueue_follow_up(h.session_id, "and bump version".into(), None, None, None)
        .await
        .unwrap();
    let replaced = h.store.get_queue_status(h.session_id).await.unwrap().unwrap();
    assert_eq!(replaced.id, first.id, "still exactly one row");
    assert_eq!(replaced.message, "and bump version");

    running.await.unwrap().unwrap();

    // E1 consumed the message and chained a new coding execution with it.
    wait_for(
        || async {
            let execs = h.store.list_executions(h.session_id).await.unwrap();
            let agents: Vec<_> = execs
                .iter()
                .filter(|e| e.run_reason == RunReason::CodingAgent)
                .collect();
            agents.len() == 2 && agents.iter().all(|e| e.status.is_terminal())
        },
        "follow-up execution to finish",
    )
    .await;

    let e1_after = h.store.get_execution(e1.id).await.unwrap();
    assert!(e1_after.queued_follow_up_consumed);
    assert!(h
        .store
        .get_queue_status(h.session_id)
        .await
        .unwrap()
        .is_none());

    // The follow-up prompt reached the agent.
    let worktree = h
        .managed_root
        .join(h.workspace_id.to_string())
        .join("app");
    let changes = std::fs::read_to_string(worktree.join("CHANGES.md")).unwrap();
    assert!(changes.contains("and bump version"));
}

// Chained script actions capture repo snapshots like any other execution.
#[tokio::test(flavor = "multi_thread")]
async fn chained_cleanup_records_repo_snapshots() {
    let h = harness(COMMIT_AGENT).await;

    // A cleanup script in the repo run configuration makes the chain run a
    // cleanup action after the coding action terminates.
    let dir = h.source_path.join(".overseer");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("run.toml"), "cleanup = \"true\"\n").unwrap();
    git::git(&h.source_path, &["add", "."]).unwrap();
    git::git(&h.source_path, &["commit", "-m", "add run config"]).unwrap();

    let execution = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, execution.id, "do work", "n-clean");
    h.orchestrator.handle_intent(intent).await.unwrap();

    wait_for(
        || async {
            let execs = h.store.list_executions(h.session_id).await.unwrap();
            execs.iter().any(|e| {
                e.run_reason == RunReason::Cleanup && e.status == ExecutionStatus::Completed
            })
        },
        "cleanup execution to finish",
    )
    .await;

    let execs = h.store.list_executions(h.session_id).await.unwrap();
    let cleanup = execs
        .iter()
        .find(|e| e.run_reason == RunReason::Cleanup)
        .unwrap();
    let states = h.store.get_repo_states(cleanup.id).await.unwrap();
    assert_eq!(states.len(), 1);
    assert!(states[0].before_head_commit.is_some());
    assert!(states[0].after_head_commit.is_some());
}

// Approval gate: a pending approval suspends completion; rejection fails.
#[tokio::test(flavor = "multi_thread")]
async fn approval_gate_holds_execution() {
    let h = harness(SLOW_COMMIT_AGENT).await;

    let e1 = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, e1.id, "risky change", "n-s3");
    let orchestrator = h.orchestrator.clone();
    let running = tokio::spawn(async move { orchestrator.handle_intent(intent).await });

    wait_for(
        || async {
            h.store.get_execution(e1.id).await.unwrap().status == ExecutionStatus::Running
        },
        "execution to start",
    )
    .await;

    let approval = h
        .orchestrator
        .approvals()
        .request(
            h.workspace_id,
            h.session_id,
            e1.id,
            "dangerous_write",
            "allow the risky change?",
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        h.store.get_session(h.session_id).await.unwrap().status,
        SessionStatus::NeedsAttention
    );

    // Let the agent process exit; the execution must stay running while
    // the approval is pending.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(
        h.store.get_execution(e1.id).await.unwrap().status,
        ExecutionStatus::Running
    );

    h.store
        .respond_approval(
            approval.id,
            overseer_common::types::ApprovalStatus::Rejected,
            "user-1".into(),
        )
        .await
        .unwrap();

    running.await.unwrap().unwrap();
    let done = h.store.get_execution(e1.id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Failed);
    let message = done.error_message.unwrap();
    assert!(message.contains("rejected"), "message was: {message}");
}

#[tokio::test(flavor = "multi_thread")]
async fn session_reset_restores_prior_head() {
    let h = harness(COMMIT_AGENT).await;

    let mut executions = Vec::new();
    for (i, prompt) in ["one", "two", "three"].iter().enumerate() {
        let exec = h
            .store
            .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
            .await
            .unwrap();
        let intent = coding_intent(&h, exec.id, prompt, &format!("n-s4-{i}"));
        h.orchestrator.handle_intent(intent).await.unwrap();
        executions.push(exec.id);
        // Distinct started_at ordering for the reset cut-off.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (e1, e2, e3) = (executions[0], executions[1], executions[2]);
    for id in [e1, e2, e3] {
        assert_eq!(
            h.store.get_execution(id).await.unwrap().status,
            ExecutionStatus::Completed
        );
    }

    let e2_before = h
        .store
        .get_repo_states(e2)
        .await
        .unwrap()
        .remove(0)
        .before_head_commit
        .unwrap();

    let reset = h
        .orchestrator
        .reset_session(h.session_id, e2, false)
        .await
        .unwrap();
    assert_eq!(reset.run_reason, RunReason::System);
    assert_eq!(reset.status, ExecutionStatus::Completed);

    let worktree = h
        .managed_root
        .join(h.workspace_id.to_string())
        .join("app");
    assert_eq!(git::head_commit(&worktree).unwrap(), e2_before);

    assert_eq!(
        h.store.get_execution(e2).await.unwrap().status,
        ExecutionStatus::Dropped
    );
    assert_eq!(
        h.store.get_execution(e3).await.unwrap().status,
        ExecutionStatus::Dropped
    );
    // E1 is untouched.
    assert_eq!(
        h.store.get_execution(e1).await.unwrap().status,
        ExecutionStatus::Completed
    );
}

// Runner restart mid-run: the orphan sweep drops the execution, the
// restarted runner does not re-dispatch, the queued follow-up is discarded.
#[tokio::test(flavor = "multi_thread")]
async fn runner_restart_mid_run() {
    let h = harness(COMMIT_AGENT).await;

    let e1 = h
        .store
        .start_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    h.store
        .acquire_lease(e1.id, "dev-1", Duration::from_millis(50))
        .await
        .unwrap();
    h.store
        .enqueue_follow_up(h.session_id, "queued while running".into(), None, None, None)
        .await
        .unwrap();

    // The runner "crashes": no heartbeat. After the TTL the sweep reclaims.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let dropped = h.store.sweep_orphans(Utc::now()).await.unwrap();
    assert_eq!(dropped, vec![e1.id]);

    let after = h.store.get_execution(e1.id).await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Dropped);
    assert!(!after.queued_follow_up_consumed);
    assert!(h
        .store
        .get_queue_status(h.session_id)
        .await
        .unwrap()
        .is_none());

    // Restarted runner sees a terminal execution: the intent is ignored,
    // nothing is spawned, status does not change.
    let intent = coding_intent(&h, e1.id, "should not run", "n-s5");
    h.orchestrator.handle_intent(intent).await.unwrap();
    assert_eq!(
        h.store.get_execution(e1.id).await.unwrap().status,
        ExecutionStatus::Dropped
    );
    let log_file = h.managed_root.join(".logs").join(format!("{}.jsonl", e1.id));
    assert!(!log_file.exists(), "no process may have been spawned");
}

// Cross-device rejection: nack, no lease, no process.
#[tokio::test(flavor = "multi_thread")]
async fn cross_device_rejection() {
    let h = harness(COMMIT_AGENT).await;
    let dispatch =
        DispatchClient::new(h.store.clone(), "dev-1".into(), DEVICE_KEY_B64, 64).unwrap();

    let execution = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let mut intent = coding_intent(&h, execution.id, "misrouted", "n-s6");
    intent.target_device_id = "dev-2".into();
    intent.sign(DEVICE_KEY).unwrap();
    h.store.submit_intent(intent).await.unwrap();

    let accepted = dispatch.poll_once().await.unwrap();
    assert!(accepted.is_empty());

    // Nacked with a device mismatch audit entry; no lease, no process.
    let logs = h.store.get_logs(execution.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(h.store.get_lease(execution.id).await.unwrap().is_none());
    assert_eq!(
        h.store.get_execution(execution.id).await.unwrap().status,
        ExecutionStatus::Pending
    );
    let log_file = h
        .managed_root
        .join(".logs")
        .join(format!("{}.jsonl", execution.id));
    assert!(!log_file.exists());
}

// Archival policy: opted-in removal deletes worktrees; unarchiving
// re-materialises them on the next ensure.
#[tokio::test(flavor = "multi_thread")]
async fn archive_policy_is_explicit_and_reversible() {
    let h = harness_opts(COMMIT_AGENT, true).await;
    h.orchestrator.spawn_workspace_watcher();

    let execution = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, execution.id, "initial work", "n-arch");
    h.orchestrator.handle_intent(intent).await.unwrap();

    let worktree = h
        .managed_root
        .join(h.workspace_id.to_string())
        .join("app");
    assert!(worktree.is_dir());

    h.store
        .update_workspace(
            h.workspace_id,
            overseer_store::WorkspacePatch {
                archived: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    wait_for(
        || async { !worktree.exists() },
        "archival to remove the worktree",
    )
    .await;

    // Unarchive and run again: the worktree comes back.
    h.store
        .update_workspace(
            h.workspace_id,
            overseer_store::WorkspacePatch {
                archived: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let execution = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, execution.id, "back again", "n-arch-2");
    h.orchestrator.handle_intent(intent).await.unwrap();
    assert!(worktree.is_dir());
}

// Every runner mutation stays under the managed root.
#[tokio::test(flavor = "multi_thread")]
async fn managed_root_confines_all_writes() {
    let h = harness(COMMIT_AGENT).await;

    let execution = h
        .store
        .create_pending_execution(h.workspace_id, h.session_id, RunReason::CodingAgent, None)
        .await
        .unwrap();
    let intent = coding_intent(&h, execution.id, "write things", "n-inv5");
    h.orchestrator.handle_intent(intent).await.unwrap();

    // Everything the runner created lives under the managed root: the
    // worktree, the journal, the state dir.
    let ws_dir = h.managed_root.join(h.workspace_id.to_string());
    assert!(ws_dir.join("app").is_dir());
    assert!(h.managed_root.join(".logs").is_dir());
    // And the managed root itself is the nested well-known subdir.
    assert!(h
        .managed_root
        .ends_with(overseerd::config::MANAGED_SUBDIR));
}
