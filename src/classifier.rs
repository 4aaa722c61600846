//! Classifier: decides project kind and start spec from repo contents.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::app::{AppKind, StartSpec};
use crate::error::{Result, SupervisorError};

pub(crate) const IGNORED_CHILDREN: &[&str] = &["__MACOSX", ".DS_Store"];

#[derive(Debug)]
pub struct Classification {
    pub kind: AppKind,
    pub root_path: PathBuf,
    pub start_spec: Option<StartSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: Scripts,
}

#[derive(Debug, Default, Deserialize)]
struct Scripts {
    start: Option<String>,
}

/// Classifies an extracted project root per §4.3.
pub fn classify(extracted_root: &Path) -> Result<Classification> {
    let root = descend_to_real_root(extracted_root)?;

    let manifest_path = root.join("package.json");
    if manifest_path.is_file() {
        let start_spec = derive_node_start_spec(&manifest_path, &root)?;
        return Ok(Classification {
            kind: AppKind::Node,
            root_path: root,
            start_spec: Some(start_spec),
        });
    }

    if root.join("index.html").is_file() {
        return Ok(Classification {
            kind: AppKind::Static,
            root_path: root,
            start_spec: None,
        });
    }

    Err(SupervisorError::UnclassifiableProject)
}

/// Descends while the directory contains exactly one (non-ignored) child
/// directory and nothing else of interest, to find the "real" project root.
fn descend_to_real_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let entries: Vec<_> = fs::read_dir(&current)
            .map_err(anyhow::Error::from)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                !IGNORED_CHILDREN.contains(&e.file_name().to_string_lossy().as_ref())
            })
            .collect();

        if entries.len() == 1 {
            let only = &entries[0];
            let file_type = only.file_type().map_err(anyhow::Error::from)?;
            if file_type.is_dir() {
                current = only.path();
                continue;
            }
        }

        break;
    }

    Ok(current)
}

/// §4.3 step 2: if `start` is exactly `node <file>`, use the interpreter
/// directly; otherwise fall back to the package manager's `start` command.
/// Any other shape of `start` (shell scripts, chained commands, etc.) falls
/// through to the package-manager form cleanly, per the Open Question in §9.
fn derive_node_start_spec(manifest_path: &Path, root: &Path) -> Result<StartSpec> {
    let raw = fs::read_to_string(manifest_path).map_err(anyhow::Error::from)?;
    let manifest: PackageManifest = serde_json::from_str(&raw).map_err(anyhow::Error::from)?;

    if let Some(start) = &manifest.scripts.start {
        let words: Vec<&str> = start.split_whitespace().collect();
        if words.len() == 2 && words[0] == "node" {
            return Ok(StartSpec {
                command: "node".to_string(),
                args: vec![words[1].to_string()],
            });
        }
    }

    Ok(StartSpec {
        command: package_manager_command(root),
        args: vec!["run".to_string(), "start".to_string()],
    })
}

/// Picks the production package manager per §4.9 step 4's lockfile table.
fn package_manager_command(root: &Path) -> String {
    if root.join("pnpm-lock.yaml").is_file() {
        "pnpm".to_string()
    } else if root.join("yarn.lock").is_file() {
        "yarn".to_string()
    } else {
        "npm".to_string()
    }
}

/// The install invocation for a node project, per §4.9 step 4.
pub fn install_command(root: &Path) -> (String, Vec<String>) {
    if root.join("pnpm-lock.yaml").is_file() {
        ("pnpm".to_string(), vec!["install".to_string(), "--prod".to_string()])
    } else if root.join("yarn.lock").is_file() {
        ("yarn".to_string(), vec!["install".to_string(), "--production".to_string()])
    } else if root.join("package-lock.json").is_file() {
        ("npm".to_string(), vec!["ci".to_string()])
    } else {
        ("npm".to_string(), vec!["install".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn classifies_static_project_with_index_html() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let classification = classify(dir.path()).expect("should classify");
        assert_eq!(classification.kind, AppKind::Static);
        assert!(classification.start_spec.is_none());
    }

    #[test]
    fn classifies_node_project_with_direct_interpreter_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"start":"node server.js"}}"#,
        )
        .unwrap();

        let classification = classify(dir.path()).expect("should classify");
        assert_eq!(classification.kind, AppKind::Node);
        let spec = classification.start_spec.unwrap();
        assert_eq!(spec.command, "node");
        assert_eq!(spec.args, vec!["server.js".to_string()]);
    }

    #[test]
    fn falls_back_to_package_manager_for_other_start_shapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"start":"node --inspect server.js"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("yarn.lock"), "").unwrap();

        let classification = classify(dir.path()).expect("should classify");
        let spec = classification.start_spec.unwrap();
        assert_eq!(spec.command, "yarn");
        assert_eq!(spec.args, vec!["run".to_string(), "start".to_string()]);
    }

    #[test]
    fn descends_through_single_nested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("my-project-1.0.0");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("index.html"), "hi").unwrap();

        let classification = classify(dir.path()).expect("should classify");
        assert_eq!(classification.root_path, nested);
    }

    #[test]
    fn rejects_unclassifiable_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("README.md"), "hi").unwrap();

        let result = classify(dir.path());
        assert!(matches!(result, Err(SupervisorError::UnclassifiableProject)));
    }
}
