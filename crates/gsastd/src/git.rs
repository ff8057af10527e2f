//! Git clone mechanics for the worker's repository source realization.
//!
//! Provider-specific enumeration (GitHub/GitLab API calls) lives in
//! `reposource.rs`; this module is the single, opaque "clone a URL to a
//! directory" operation every repository source funnels into.

use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("clone timed out after {0}s")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Clone `url` into `dest`. Shallow (`--depth 1`) unless `shallow` is false
/// (a plugin requiring full git history, e.g. for blame-based secret
/// scanning, forces a full clone).
pub async fn clone(url: &str, dest: &Path, shallow: bool, timeout_secs: u64) -> Result<()> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("clone");
    if shallow {
        cmd.args(["--depth", "1"]);
    }
    cmd.arg(url).arg(dest);

    let child = cmd.output();
    match timeout(Duration::from_secs(timeout_secs), child).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(())
            } else {
                Err(GitError::CommandFailed(
                    String::from_utf8_lossy(&output.stderr).to_string(),
                ))
            }
        }
        Ok(Err(e)) => Err(GitError::Execution(e)),
        Err(_) => Err(GitError::Timeout(timeout_secs)),
    }
}

/// Synchronous variant used by the CLI client / offline tooling where no
/// tokio runtime is running.
pub fn clone_blocking(url: &str, dest: &Path, shallow: bool) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.arg("clone");
    if shallow {
        cmd.args(["--depth", "1"]);
    }
    cmd.arg(url).arg(dest);

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}
