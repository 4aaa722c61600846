//! App Registry: the JSON document that is the single source of truth for
//! every app's metadata. Writes are atomic (temp file + rename); readers
//! never see a partially-written document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::app::App;
use crate::error::{Result, SupervisorError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    apps: HashMap<String, App>,
}

/// Guards the on-disk `apps.json` document. A single `tokio::sync::RwLock`
/// serializes writers; readers may run concurrently with each other, never
/// with a writer. There is no long-lived in-memory cache beyond the lock's
/// guarded value -- every read and write round-trips through the same
/// in-memory document, which is persisted on every mutation.
pub struct Registry {
    path: PathBuf,
    apps_root: PathBuf,
    logs_root: PathBuf,
    document: RwLock<Document>,
}

impl Registry {
    /// Loads the registry document from `path` if it exists, or starts with
    /// an empty one.
    pub async fn load(
        path: impl Into<PathBuf>,
        apps_root: impl Into<PathBuf>,
        logs_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let apps_root = apps_root.into();
        let logs_root = logs_root.into();

        let document = if path.is_file() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)?;
            serde_json::from_str(&raw).map_err(anyhow::Error::from)?
        } else {
            Document::default()
        };

        Ok(Self {
            path,
            apps_root,
            logs_root,
            document: RwLock::new(document),
        })
    }

    pub fn apps_root(&self) -> &Path {
        &self.apps_root
    }

    /// Platform-level root that every app's log files live under, as a
    /// sibling of `apps_root` rather than nested inside any one app's
    /// working directory -- so version snapshot/restore never touches logs,
    /// and a static app's own file server never serves them.
    pub fn logs_root(&self) -> &Path {
        &self.logs_root
    }

    /// Best-effort liveness check for the platform health endpoint: the
    /// registry document's parent directory must exist and be writable-looking
    /// (a directory, not a dangling path) for the registry to be considered
    /// reachable.
    pub fn is_reachable(&self) -> bool {
        self.path
            .parent()
            .map(|parent| parent.is_dir())
            .unwrap_or(false)
    }

    pub fn working_dir_for(&self, name: &str) -> PathBuf {
        self.apps_root.join(name)
    }

    pub async fn list(&self) -> Vec<App> {
        self.document.read().await.apps.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Result<App> {
        self.document
            .read()
            .await
            .apps
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::AppMissing(name.to_string()))
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.document.read().await.apps.contains_key(name)
    }

    pub async fn insert(&self, app: App) -> Result<()> {
        let mut document = self.document.write().await;
        if document.apps.contains_key(&app.name) {
            return Err(SupervisorError::AppAlreadyExists(app.name));
        }
        document.apps.insert(app.name.clone(), app);
        self.persist(&document).await
    }

    /// Applies `mutator` to the named app's in-memory record and persists the
    /// whole document atomically, returning the updated record.
    pub async fn mutate<F>(&self, name: &str, mutator: F) -> Result<App>
    where
        F: FnOnce(&mut App),
    {
        let mut document = self.document.write().await;
        let app = document
            .apps
            .get_mut(name)
            .ok_or_else(|| SupervisorError::AppMissing(name.to_string()))?;
        mutator(app);
        let updated = app.clone();
        self.persist(&document).await?;
        Ok(updated)
    }

    /// Applies each `(name, mutator)` pair to the in-memory document and
    /// persists the whole document exactly once, instead of once per
    /// mutation. Used by the health sweep, which would otherwise round-trip
    /// the registry file once per app every interval. Names no longer
    /// present in the document (e.g. deleted mid-sweep) are skipped rather
    /// than failing the whole batch.
    pub async fn mutate_many(
        &self,
        mutations: Vec<(String, Box<dyn FnOnce(&mut App) + Send>)>,
    ) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }

        let mut document = self.document.write().await;
        for (name, mutator) in mutations {
            if let Some(app) = document.apps.get_mut(&name) {
                mutator(app);
            }
        }
        self.persist(&document).await
    }

    pub async fn remove(&self, name: &str) -> Result<App> {
        let mut document = self.document.write().await;
        let app = document
            .apps
            .remove(name)
            .ok_or_else(|| SupervisorError::AppMissing(name.to_string()))?;
        self.persist(&document).await?;
        Ok(app)
    }

    async fn persist(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(anyhow::Error::from)?;
        }

        let serialized = serde_json::to_string_pretty(document).map_err(anyhow::Error::from)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, serialized)
            .await
            .map_err(anyhow::Error::from)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppKind, AppStatus, HealthRecord};

    fn sample_app(name: &str) -> App {
        App {
            name: name.to_string(),
            kind: AppKind::Static,
            working_dir: format!("/apps/{name}"),
            port: 5000,
            current_version: "v1".to_string(),
            versions: vec![],
            env: HashMap::new(),
            autorestart: true,
            webhook_secret: None,
            status: AppStatus::Stopped,
            health: HealthRecord::default(),
            start_spec: None,
            source: None,
        }
    }

    #[tokio::test]
    async fn inserts_and_reads_back_an_app() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::load(dir.path().join("apps.json"), dir.path(), dir.path().join("logs"))
            .await
            .expect("load should succeed");

        registry.insert(sample_app("demo")).await.unwrap();
        let fetched = registry.get("demo").await.unwrap();
        assert_eq!(fetched.name, "demo");
    }

    #[tokio::test]
    async fn rejects_duplicate_insert() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::load(dir.path().join("apps.json"), dir.path(), dir.path().join("logs"))
            .await
            .unwrap();

        registry.insert(sample_app("demo")).await.unwrap();
        let result = registry.insert(sample_app("demo")).await;
        assert!(matches!(result, Err(SupervisorError::AppAlreadyExists(_))));
    }

    #[tokio::test]
    async fn persists_across_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("apps.json");

        let registry = Registry::load(&path, dir.path(), dir.path().join("logs")).await.unwrap();
        registry.insert(sample_app("demo")).await.unwrap();
        drop(registry);

        let reloaded = Registry::load(&path, dir.path(), dir.path().join("logs")).await.unwrap();
        assert!(reloaded.exists("demo").await);
    }

    #[tokio::test]
    async fn mutate_updates_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::load(dir.path().join("apps.json"), dir.path(), dir.path().join("logs"))
            .await
            .unwrap();

        registry.insert(sample_app("demo")).await.unwrap();
        registry
            .mutate("demo", |app| app.status = AppStatus::Running)
            .await
            .unwrap();

        let fetched = registry.get("demo").await.unwrap();
        assert_eq!(fetched.status, AppStatus::Running);
    }

    #[tokio::test]
    async fn mutate_many_applies_every_update_in_a_single_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::load(dir.path().join("apps.json"), dir.path(), dir.path().join("logs"))
            .await
            .unwrap();

        registry.insert(sample_app("demo-a")).await.unwrap();
        registry.insert(sample_app("demo-b")).await.unwrap();

        let mutations: Vec<(String, Box<dyn FnOnce(&mut App) + Send>)> = vec![
            (
                "demo-a".to_string(),
                Box::new(|app: &mut App| app.status = AppStatus::Running),
            ),
            (
                "demo-b".to_string(),
                Box::new(|app: &mut App| app.status = AppStatus::Crashed),
            ),
            (
                "ghost".to_string(),
                Box::new(|app: &mut App| app.status = AppStatus::Running),
            ),
        ];
        registry.mutate_many(mutations).await.unwrap();

        assert_eq!(registry.get("demo-a").await.unwrap().status, AppStatus::Running);
        assert_eq!(registry.get("demo-b").await.unwrap().status, AppStatus::Crashed);
    }

    #[tokio::test]
    async fn remove_deletes_and_returns_app() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::load(dir.path().join("apps.json"), dir.path(), dir.path().join("logs"))
            .await
            .unwrap();

        registry.insert(sample_app("demo")).await.unwrap();
        let removed = registry.remove("demo").await.unwrap();
        assert_eq!(removed.name, "demo");
        assert!(!registry.exists("demo").await);
    }

    #[tokio::test]
    async fn mutate_missing_app_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::load(dir.path().join("apps.json"), dir.path(), dir.path().join("logs"))
            .await
            .unwrap();

        let result = registry.mutate("ghost", |_| {}).await;
        assert!(matches!(result, Err(SupervisorError::AppMissing(_))));
    }
}
