//! Thin wrapper over the git CLI.
//!
//! Every mutating repository operation goes through the CLI so behavior
//! matches what an operator would see running the same command. Failures
//! are classified: lock contention is `Transient` and retryable, anything
//! else surfaces as `Fatal` with the captured stderr.

use std::path::Path;
use std::process::Command;

use overseer_common::error::{RunnerError, RunnerResult};

/// stderr fragments that indicate somebody else holds a repository lock.
const TRANSIENT_MARKERS: &[&str] = &[
    "index.lock",
    "shallow.lock",
    "cannot lock ref",
    "Unable to create",
    "Resource temporarily unavailable",
];

/// Run `git <args>` in `dir`, returning trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> RunnerResult<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .map_err(|e| RunnerError::io(format!("spawn git {}", args.join(" ")), e))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let context = format!(
        "git {} in {} failed ({}): {}",
        args.join(" "),
        dir.display(),
        output.status,
        stderr
    );
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        Err(RunnerError::transient(context))
    } else {
        Err(RunnerError::fatal(context))
    }
}

pub fn head_commit(dir: &Path) -> RunnerResult<String> {
    git(dir, &["rev-parse", "HEAD"])
}

pub fn current_branch(dir: &Path) -> RunnerResult<String> {
    git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// A worktree is clean when `status --porcelain` prints nothing.
pub fn is_clean(dir: &Path) -> RunnerResult<bool> {
    Ok(git(dir, &["status", "--porcelain"])?.is_empty())
}

pub fn reset_hard(dir: &Path, commit: &str) -> RunnerResult<()> {
    git(dir, &["reset", "--hard", commit])?;
    Ok(())
}

pub fn branch_exists(dir: &Path, branch: &str) -> RunnerResult<bool> {
    match git(
        dir,
        &[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ],
    ) {
        Ok(_) => Ok(true),
        Err(RunnerError::Fatal { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
