//! Version Store: immutable per-app snapshots of a working directory, with
//! rollback support.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::app::{DeployMethod, SourceRef, Version};
use crate::error::Result;

/// Names skipped when copying a working directory into or out of a snapshot:
/// the git metadata directory, the node dependency cache, any nested
/// `versions/` subtree (which would otherwise recurse into itself), and
/// `logs` -- logs live in a platform-level root outside the working
/// directory, so this only guards against a stray same-named entry.
const SKIPPED: &[&str] = &[".git", "node_modules", "versions", "logs"];

/// Creates a new version snapshot of `working_dir` under
/// `<apps>/<name>/versions/v<unix-millis>` and returns its record.
pub fn snapshot(
    working_dir: &Path,
    versions_root: &Path,
    method: DeployMethod,
    source: Option<SourceRef>,
) -> Result<Version> {
    fs::create_dir_all(versions_root).map_err(anyhow::Error::from)?;

    let now_ms = unix_millis();
    let id = format!("v{now_ms}");
    let snapshot_dir = versions_root.join(&id);

    copy_tree(working_dir, &snapshot_dir)?;

    Ok(Version {
        id,
        created_at_unix_ms: now_ms,
        method,
        source,
        snapshot_dir: snapshot_dir.display().to_string(),
    })
}

/// Replaces `working_dir`'s contents with a fresh copy of `version`'s
/// snapshot, per §4.4's rollback step (b). The supervisor is responsible for
/// stopping the app before calling this and starting it again afterward.
pub fn restore(working_dir: &Path, version: &Version) -> Result<()> {
    if working_dir.exists() {
        fs::remove_dir_all(working_dir).map_err(anyhow::Error::from)?;
    }
    copy_tree(Path::new(&version.snapshot_dir), working_dir)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(anyhow::Error::from)?;

    for entry in fs::read_dir(src).map_err(anyhow::Error::from)? {
        let entry = entry.map_err(anyhow::Error::from)?;
        let name = entry.file_name();
        if SKIPPED.contains(&name.to_string_lossy().as_ref()) {
            continue;
        }

        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let file_type = entry.file_type().map_err(anyhow::Error::from)?;

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path).map_err(anyhow::Error::from)?;
        }
        // Symlinks in a working directory (there should be none) are skipped.
    }

    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as u64
}

/// Convenience used by the registry/deploy pipeline to compute where a new
/// app's versions live before any version exists yet.
pub fn versions_root_for(apps_root: &Path, name: &str) -> PathBuf {
    apps_root.join(name).join("versions")
}
