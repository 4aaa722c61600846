//! Log Pipeline: append-only per-app log files with size-based rotation,
//! plus live fan-out to any attached streaming readers.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::error::Result;
use crate::registry::Registry;

/// Interval between sweeps that delete log files left behind by apps no
/// longer in the registry (e.g. `DELETE /apps/:name`, which removes the
/// app's working directory but not its logs -- logs live in a
/// platform-level root independent of it). `delete_app` also purges
/// eagerly; this sweep is the backstop for anything that slips past it.
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default rotation threshold: once the active log file crosses this size,
/// it's rotated out to `.1` and a fresh file is started.
pub const DEFAULT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of rotated backlog files kept (`.1` .. `.N`); anything
/// older is deleted. Overridden by `PAAS_LOG_MAX_FILES` / `[supervisor]
/// log_max_files` (see `crate::config`).
pub const DEFAULT_MAX_FILES: u32 = 5;

/// Bound on the live fan-out channel per subscriber. A slow subscriber that
/// can't keep up gets lines dropped rather than backpressuring the app.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Which stream a line originated from, used for the origin marker in the
/// persisted line format.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Origin {
    Stdout,
    Stderr,
    System,
}

impl Origin {
    fn marker(self) -> &'static str {
        match self {
            Origin::Stdout => "out",
            Origin::Stderr => "err",
            Origin::System => "sys",
        }
    }
}

/// A single app's log writer: owns the active file handle and the set of
/// live subscribers currently tailing it. Files live flat under a shared
/// `logs_root` as `<name>.log[.1..max_files]`, a sibling of the apps root
/// rather than nested inside any one app's working directory.
pub struct AppLog {
    logs_root: PathBuf,
    name: String,
    rotate_bytes: u64,
    max_files: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    file: std::fs::File,
    size: u64,
    subscribers: Vec<mpsc::Sender<String>>,
}

impl AppLog {
    /// Opens (creating if necessary) the active log file at
    /// `logs_root/<name>.log`.
    pub fn open(logs_root: &Path, name: &str, rotate_bytes: u64, max_files: u32) -> Result<Self> {
        fs::create_dir_all(logs_root).map_err(anyhow::Error::from)?;
        let path = active_path(logs_root, name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(anyhow::Error::from)?;
        let size = file.metadata().map_err(anyhow::Error::from)?.len();

        Ok(Self {
            logs_root: logs_root.to_path_buf(),
            name: name.to_string(),
            rotate_bytes,
            max_files: max_files.max(1),
            inner: Mutex::new(Inner {
                file,
                size,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Appends one line of output, rotating first if the file has grown past
    /// the configured threshold. Fans the formatted line out to any live
    /// subscribers, dropping it for subscribers whose channel is full.
    pub async fn append(&self, origin: Origin, line: &str) -> Result<()> {
        let formatted = format_line(origin, line);
        let mut inner = self.inner.lock().await;

        if inner.size >= self.rotate_bytes {
            self.rotate(&mut inner)?;
        }

        let bytes = formatted.as_bytes();
        inner.file.write_all(bytes).map_err(anyhow::Error::from)?;
        inner.file.write_all(b"\n").map_err(anyhow::Error::from)?;
        inner.size += bytes.len() as u64 + 1;

        inner.subscribers.retain(|tx| {
            match tx.try_send(formatted.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    /// Appends a synthesized line recording why a child process ended, per
    /// §4.5's "exit line" note.
    pub async fn append_exit_line(&self, summary: &str) -> Result<()> {
        self.append(Origin::System, summary).await
    }

    /// Subscribes to future lines. Past lines are not replayed; callers that
    /// want history should read the log files directly.
    pub async fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        self.inner.lock().await.subscribers.push(tx);
        rx
    }

    fn rotate(&self, inner: &mut Inner) -> Result<()> {
        for n in (1..self.max_files).rev() {
            let from = rotated_path(&self.logs_root, &self.name, n);
            let to = rotated_path(&self.logs_root, &self.name, n + 1);
            if from.exists() {
                fs::rename(&from, &to).map_err(anyhow::Error::from)?;
            }
        }

        let oldest = rotated_path(&self.logs_root, &self.name, self.max_files);
        if oldest.exists() {
            fs::remove_file(&oldest).map_err(anyhow::Error::from)?;
        }

        fs::rename(
            active_path(&self.logs_root, &self.name),
            rotated_path(&self.logs_root, &self.name, 1),
        )
        .map_err(anyhow::Error::from)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(active_path(&self.logs_root, &self.name))
            .map_err(anyhow::Error::from)?;
        inner.file = file;
        inner.size = 0;
        Ok(())
    }
}

fn active_path(logs_root: &Path, name: &str) -> PathBuf {
    logs_root.join(format!("{name}.log"))
}

fn rotated_path(logs_root: &Path, name: &str, n: u32) -> PathBuf {
    logs_root.join(format!("{name}.log.{n}"))
}

/// `<rfc3339> [<origin>] <line>`, per §4.5.
fn format_line(origin: Origin, line: &str) -> String {
    let timestamp = OffsetDateTime::from_unix_timestamp(unix_seconds() as i64)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| "unknown-time".to_string());
    format!("{timestamp} [{}] {line}", origin.marker())
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs()
}

/// Registry of per-app log writers, keyed by app name, shared across the
/// supervisor and the HTTP layer.
#[derive(Default)]
pub struct LogRegistry {
    logs: Mutex<std::collections::HashMap<String, Arc<AppLog>>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the log writer for `name`, opening one under
    /// `logs_root/<name>.log` if it doesn't exist yet.
    pub async fn get_or_open(
        &self,
        name: &str,
        logs_root: &Path,
        rotate_bytes: u64,
        max_files: u32,
    ) -> Result<Arc<AppLog>> {
        let mut logs = self.logs.lock().await;
        if let Some(existing) = logs.get(name) {
            return Ok(existing.clone());
        }

        let log = Arc::new(AppLog::open(logs_root, name, rotate_bytes, max_files)?);
        logs.insert(name.to_string(), log.clone());
        Ok(log)
    }

    pub async fn remove(&self, name: &str) {
        self.logs.lock().await.remove(name);
    }
}

/// Deletes `name`'s log files (active and rotated backlog) from
/// `logs_root`. Best effort and used eagerly by `DELETE /apps/:name` so a
/// deleted app's logs don't linger until the next orphan sweep.
pub async fn remove_for_app(logs_root: &Path, name: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(logs_root).await else {
        return;
    };

    let active_name = format!("{name}.log");
    let rotated_prefix = format!("{name}.log.");
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if *file_name == active_name || file_name.starts_with(&rotated_prefix) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

/// Runs forever, periodically deleting any log files under `logs_root`
/// that don't belong to a currently registered app.
pub async fn run_orphan_sweep(logs_root: PathBuf, registry: Arc<Registry>) {
    loop {
        tokio::time::sleep(ORPHAN_SWEEP_INTERVAL).await;
        if let Err(err) = purge_orphans(&logs_root, &registry).await {
            warn!(%err, "orphan log sweep failed");
        }
    }
}

async fn purge_orphans(logs_root: &Path, registry: &Registry) -> Result<()> {
    let known: std::collections::HashSet<String> =
        registry.list().await.into_iter().map(|a| a.name).collect();

    let mut entries = tokio::fs::read_dir(logs_root)
        .await
        .map_err(anyhow::Error::from)?;
    while let Some(entry) = entries.next_entry().await.map_err(anyhow::Error::from)? {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(owner) = file_name.split(".log").next() else {
            continue;
        };
        if owner.is_empty() || known.contains(owner) {
            continue;
        }
        let _ = tokio::fs::remove_file(entry.path()).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_lines_with_origin_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AppLog::open(dir.path(), "demo", DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES)
            .expect("open log");

        log.append(Origin::Stdout, "listening on port 5000")
            .await
            .expect("append should succeed");

        let contents = fs::read_to_string(dir.path().join("demo.log")).unwrap();
        assert!(contents.contains("[out] listening on port 5000"));
    }

    #[tokio::test]
    async fn rotates_when_threshold_exceeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AppLog::open(dir.path(), "demo", 16, DEFAULT_MAX_FILES).expect("open log");

        log.append(Origin::Stdout, "first line long enough to exceed")
            .await
            .unwrap();
        log.append(Origin::Stdout, "second line")
            .await
            .unwrap();

        assert!(dir.path().join("demo.log.1").exists());
        assert!(dir.path().join("demo.log").exists());
    }

    #[tokio::test]
    async fn live_subscribers_receive_new_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AppLog::open(dir.path(), "demo", DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES)
            .expect("open log");

        let mut rx = log.subscribe().await;
        log.append(Origin::Stderr, "warning: low memory")
            .await
            .unwrap();

        let received = rx.recv().await.expect("should receive a line");
        assert!(received.contains("[err] warning: low memory"));
    }

    #[tokio::test]
    async fn registry_reuses_existing_log_handle() {
        let logs_root = tempfile::tempdir().expect("tempdir");
        let registry = LogRegistry::new();

        let first = registry
            .get_or_open("demo", logs_root.path(), DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES)
            .await
            .unwrap();
        let second = registry
            .get_or_open("demo", logs_root.path(), DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn remove_for_app_deletes_active_and_rotated_files_only_for_that_app() {
        let logs_root = tempfile::tempdir().expect("tempdir");
        let log = AppLog::open(logs_root.path(), "demo", 16, 5).unwrap();
        log.append(Origin::Stdout, "first line long enough to exceed")
            .await
            .unwrap();
        log.append(Origin::Stdout, "second line").await.unwrap();
        drop(log);
        AppLog::open(logs_root.path(), "other", DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES).unwrap();

        remove_for_app(logs_root.path(), "demo").await;

        assert!(!logs_root.path().join("demo.log").exists());
        assert!(!logs_root.path().join("demo.log.1").exists());
        assert!(logs_root.path().join("other.log").exists());
    }

    #[tokio::test]
    async fn purge_orphans_removes_logs_for_apps_no_longer_registered() {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let apps_root = data_dir.path().join("apps");
        let logs_root = data_dir.path().join("logs");
        tokio::fs::create_dir_all(&apps_root).await.unwrap();

        let registry = Registry::load(data_dir.path().join("data/apps.json"), &apps_root, &logs_root)
            .await
            .unwrap();
        registry
            .insert(crate::app::App {
                name: "kept".to_string(),
                kind: crate::app::AppKind::Static,
                working_dir: apps_root.join("kept").display().to_string(),
                port: 5000,
                current_version: "v1".to_string(),
                versions: vec![],
                env: Default::default(),
                autorestart: true,
                webhook_secret: None,
                status: crate::app::AppStatus::Stopped,
                health: crate::app::HealthRecord::default(),
                start_spec: None,
                source: None,
            })
            .await
            .unwrap();

        AppLog::open(&logs_root, "kept", DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES).unwrap();
        AppLog::open(&logs_root, "gone", DEFAULT_ROTATE_BYTES, DEFAULT_MAX_FILES).unwrap();

        purge_orphans(&logs_root, &registry).await.unwrap();

        assert!(logs_root.join("kept.log").exists());
        assert!(!logs_root.join("gone.log").exists());
    }
}
