//! Deployment Pipeline: turns a new archive or git source into a running,
//! registered app. Failures unwind every resource committed so far.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::app::{normalize_name, App, AppKind, DeployMethod, HealthRecord, SourceRef, Version};
use crate::archive;
use crate::classifier::{self, classify};
use crate::error::{Result, SupervisorError};
use crate::git;
use crate::logs::{AppLog, Origin};
use crate::ports;
use crate::registry::Registry;
use crate::supervisor::Supervisor;

/// Where a new app's contents come from.
pub enum Source {
    Archive(Vec<u8>),
    Git { url: String, branch: String },
}

/// A cleanup action taken if a later pipeline step fails, run top-to-bottom
/// in reverse commit order.
enum Unwind {
    RemoveAppDir(PathBuf),
}

impl Unwind {
    fn run(self) {
        match self {
            Unwind::RemoveAppDir(dir) => {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    }
}

pub async fn deploy(
    registry: &Registry,
    supervisor: &Supervisor,
    port_floor: u16,
    requested_name: &str,
    source: Source,
) -> Result<App> {
    let mut stack: Vec<Unwind> = Vec::new();
    match deploy_inner(registry, supervisor, port_floor, requested_name, source, &mut stack).await
    {
        Ok(app) => Ok(app),
        Err(err) => {
            while let Some(action) = stack.pop() {
                action.run();
            }
            Err(err)
        }
    }
}

async fn deploy_inner(
    registry: &Registry,
    supervisor: &Supervisor,
    port_floor: u16,
    requested_name: &str,
    source: Source,
    stack: &mut Vec<Unwind>,
) -> Result<App> {
    let name = normalize_name(requested_name);
    if name.is_empty() {
        return Err(SupervisorError::InvalidName(requested_name.to_string()));
    }
    if registry.exists(&name).await {
        return Err(SupervisorError::AppAlreadyExists(name));
    }

    let working_dir = registry.working_dir_for(&name);
    if working_dir.exists() {
        return Err(SupervisorError::AppAlreadyExists(name));
    }
    std::fs::create_dir_all(&working_dir).map_err(anyhow::Error::from)?;
    stack.push(Unwind::RemoveAppDir(working_dir.clone()));

    let log = AppLog::open(
        registry.logs_root(),
        &name,
        supervisor.log_rotate_bytes(),
        supervisor.log_max_files(),
    )?;

    let (method, source_ref) = match source {
        Source::Archive(bytes) => {
            archive::extract(&bytes, &working_dir)?;
            (DeployMethod::Archive, None)
        }
        Source::Git { url, branch } => {
            git::shallow_clone(&url, &branch, &working_dir, &log).await?;
            let commit = git::short_head(&working_dir).await?;
            (
                DeployMethod::Git,
                Some(SourceRef {
                    git_url: url,
                    branch,
                    commit,
                }),
            )
        }
    };

    let classification = classify(&working_dir)?;
    flatten_real_root(&working_dir, &classification.root_path)?;

    if classification.kind == AppKind::Node {
        install_dependencies(&working_dir, &log).await?;
    }

    let assigned_ports: std::collections::HashSet<u16> = registry
        .list()
        .await
        .into_iter()
        .map(|app| app.port)
        .collect();
    let port = ports::allocate(port_floor, &assigned_ports).await?;

    let versions_root = crate::versions::versions_root_for(registry.apps_root(), &name);
    let version = crate::versions::snapshot(
        &working_dir,
        &versions_root,
        method,
        source_ref.clone(),
    )?;

    let app = App {
        name: name.clone(),
        kind: classification.kind,
        working_dir: working_dir.display().to_string(),
        port,
        current_version: version.id.clone(),
        versions: vec![version],
        env: HashMap::new(),
        autorestart: true,
        webhook_secret: None,
        status: crate::app::AppStatus::Stopped,
        health: HealthRecord::default(),
        start_spec: classification.start_spec,
        source: source_ref,
    };

    registry.insert(app).await?;
    supervisor.start(&name).await?;

    registry.get(&name).await
}

/// The classifier may have descended into a single nested "real root"
/// (e.g. the wrapper directory a GitHub zipball exports under). Everything
/// downstream -- the start spec, the version snapshot, the supervisor's
/// spawn `cwd` -- is keyed off `working_dir` directly, so promote the real
/// root's contents up to `working_dir` and discard the now-empty wrapper
/// chain before anything else touches the tree.
fn flatten_real_root(working_dir: &Path, root_path: &Path) -> Result<()> {
    if root_path == working_dir {
        return Ok(());
    }

    for entry in std::fs::read_dir(root_path).map_err(anyhow::Error::from)? {
        let entry = entry.map_err(anyhow::Error::from)?;
        let dest = working_dir.join(entry.file_name());
        std::fs::rename(entry.path(), dest).map_err(anyhow::Error::from)?;
    }

    let mut dir = root_path.to_path_buf();
    while dir != working_dir {
        let _ = std::fs::remove_dir(&dir);
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }

    for leftover in classifier::IGNORED_CHILDREN {
        let _ = std::fs::remove_dir_all(working_dir.join(leftover));
        let _ = std::fs::remove_file(working_dir.join(leftover));
    }

    Ok(())
}

/// Runs the production dependency install for a node project, streaming its
/// output into the app's log as system lines.
async fn install_dependencies(root: &Path, log: &AppLog) -> Result<()> {
    let (command, args) = classifier::install_command(root);
    log.append(
        Origin::System,
        &format!("installing dependencies: {command} {}", args.join(" ")),
    )
    .await?;

    let output = Command::new(&command)
        .args(&args)
        .current_dir(root)
        .output()
        .await
        .map_err(anyhow::Error::from)?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        log.append(Origin::System, line).await?;
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        log.append(Origin::System, line).await?;
    }

    if !output.status.success() {
        return Err(SupervisorError::InstallFailed(format!(
            "{command} exited with {}",
            output.status
        )));
    }

    Ok(())
}

/// Creates and records a new version for an app already installed and
/// running, without changing which version is current. Used by the webhook
/// redeployer once it has pulled and reinstalled in place.
pub async fn snapshot_and_advance(
    registry: &Registry,
    name: &str,
    method: DeployMethod,
    source_ref: Option<SourceRef>,
) -> Result<Version> {
    let app = registry.get(name).await?;
    let working_dir = PathBuf::from(&app.working_dir);
    let versions_root = crate::versions::versions_root_for(registry.apps_root(), name);

    let version = crate::versions::snapshot(&working_dir, &versions_root, method, source_ref)?;
    let recorded = version.clone();

    registry
        .mutate(name, |a| {
            a.versions.push(version.clone());
            a.current_version = version.id.clone();
        })
        .await?;

    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn flatten_is_a_no_op_when_root_equals_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();

        flatten_real_root(dir.path(), dir.path()).expect("should succeed");

        assert!(dir.path().join("index.html").exists());
    }

    #[test]
    fn flatten_promotes_a_nested_wrapper_directory() {
        let working_dir = tempfile::tempdir().expect("tempdir");
        let wrapper = working_dir.path().join("my-repo-main");
        std::fs::create_dir(&wrapper).unwrap();
        std::fs::write(wrapper.join("package.json"), "{}").unwrap();
        std::fs::write(wrapper.join("server.js"), "listen()").unwrap();

        flatten_real_root(working_dir.path(), &wrapper).expect("should succeed");

        assert!(working_dir.path().join("package.json").exists());
        assert!(working_dir.path().join("server.js").exists());
        assert!(!wrapper.exists());
    }

    #[test]
    fn flatten_discards_ignored_siblings_left_behind_by_the_archive() {
        let working_dir = tempfile::tempdir().expect("tempdir");
        let wrapper = working_dir.path().join("my-repo-main");
        std::fs::create_dir(&wrapper).unwrap();
        std::fs::write(wrapper.join("index.html"), "hi").unwrap();
        std::fs::create_dir(working_dir.path().join("__MACOSX")).unwrap();

        flatten_real_root(working_dir.path(), &wrapper).expect("should succeed");

        assert!(working_dir.path().join("index.html").exists());
        assert!(!working_dir.path().join("__MACOSX").exists());
    }

    #[tokio::test]
    async fn deploy_spawns_from_the_flattened_root_for_nested_archives() {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let apps_root = data_dir.path().join("apps");
        tokio::fs::create_dir_all(&apps_root).await.unwrap();

        let logs_root = data_dir.path().join("logs");
        let registry = Arc::new(
            Registry::load(data_dir.path().join("data/apps.json"), &apps_root, &logs_root)
                .await
                .unwrap(),
        );
        let logs = Arc::new(crate::logs::LogRegistry::new());
        let supervisor = Supervisor::new(
            registry.clone(),
            logs.clone(),
            crate::supervisor::RestartPolicy::default(),
            crate::supervisor::StopPolicy::default(),
            crate::logs::DEFAULT_ROTATE_BYTES,
            crate::logs::DEFAULT_MAX_FILES,
        );

        // A static site wrapped in a single top-level directory, as produced
        // by a typical GitHub zipball export.
        let mut zip_bytes = Vec::new();
        {
            use std::io::Write;
            use zip::write::FileOptions;
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer
                .start_file("site-main/index.html", FileOptions::default())
                .unwrap();
            writer.write_all(b"<html>hi</html>").unwrap();
            writer.finish().unwrap();
        }

        let app = deploy(
            &registry,
            &supervisor,
            19800,
            "nested-site",
            Source::Archive(zip_bytes),
        )
        .await
        .expect("deploy should succeed");

        assert_eq!(
            app.working_dir,
            apps_root.join("nested-site").display().to_string()
        );
        assert!(std::path::Path::new(&app.working_dir)
            .join("index.html")
            .exists());
        assert!(!std::path::Path::new(&app.working_dir)
            .join("site-main")
            .exists());
    }
}
