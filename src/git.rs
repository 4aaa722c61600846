//! Thin wrapper around shelling out to the system `git` binary, in the same
//! spirit as shelling out to an external CLI for heavier lifting elsewhere
//! in the pipeline rather than pulling in a full git client library.

use std::path::Path;

use tokio::process::Command;

use crate::error::{Result, SupervisorError};
use crate::logs::{AppLog, Origin};

/// Shallow-clones `branch` of `url` into `dir` (which must not exist yet),
/// streaming git's stdout/stderr into `log` as system lines.
pub async fn shallow_clone(url: &str, branch: &str, dir: &Path, log: &AppLog) -> Result<()> {
    run_streamed(
        Command::new("git").args([
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            url,
            &dir.display().to_string(),
        ]),
        log,
    )
    .await
    .map_err(|e| SupervisorError::CloneFailed(e.to_string()))
}

/// Fetches and fast-forwards `branch` inside an already-cloned `dir`.
pub async fn pull_latest(dir: &Path, branch: &str, log: &AppLog) -> Result<()> {
    run_streamed(
        Command::new("git")
            .args(["fetch", "--depth", "1", "origin", branch])
            .current_dir(dir),
        log,
    )
    .await
    .map_err(|e| SupervisorError::CloneFailed(e.to_string()))?;

    run_streamed(
        Command::new("git")
            .args(["reset", "--hard", &format!("origin/{branch}")])
            .current_dir(dir),
        log,
    )
    .await
    .map_err(|e| SupervisorError::CloneFailed(e.to_string()))
}

/// Reads back the short commit id of `HEAD` in `dir`.
pub async fn short_head(dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(dir)
        .output()
        .await
        .map_err(anyhow::Error::from)?;

    if !output.status.success() {
        return Err(SupervisorError::CloneFailed(
            "git rev-parse failed".to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_streamed(command: &mut Command, log: &AppLog) -> anyhow::Result<()> {
    let mut child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let log_stdout = log_stream(stdout, log, Origin::System);
    let log_stderr = log_stream(stderr, log, Origin::System);
    let (status, _, _) = tokio::join!(child.wait(), log_stdout, log_stderr);

    if !status?.success() {
        anyhow::bail!("git command exited with non-zero status");
    }
    Ok(())
}

async fn log_stream<R>(reader: Option<R>, log: &AppLog, origin: Origin)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::{AsyncBufReadExt, BufReader};

    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = log.append(origin, &format!("git: {line}")).await;
    }
}
