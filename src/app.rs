//! Core data model: the entities the rest of the supervisor operates on.

use std::collections::HashMap;

use sec::Secret;
use serde::{Deserialize, Serialize};

/// Project kind as decided by the classifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Node,
    Static,
}

/// `(command, args)` pair the supervisor spawns verbatim for a `node` app.
/// `static` apps carry an empty spec; the supervisor serves `rootPath` itself.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// How a version came to exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMethod {
    Archive,
    Git,
    Webhook,
    Manual,
}

/// Where a version's source came from, when it came from source control.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub git_url: String,
    pub branch: String,
    pub commit: String,
}

/// An immutable on-disk snapshot of a past working directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Version {
    /// `v<unix-millis>`, sortable lexically and chronologically.
    pub id: String,
    pub created_at_unix_ms: u64,
    pub method: DeployMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    /// Absolute path to `apps/<name>/versions/<id>`.
    pub snapshot_dir: String,
}

/// Current observed health of a running (or stopped) app.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Running,
    Healthy,
    Unhealthy,
    Stopped,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_unix_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

/// Lifecycle state of the app as last observed by the supervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Running,
    Stopping,
    Crashed,
}

impl Default for AppStatus {
    fn default() -> Self {
        AppStatus::Stopped
    }
}

/// The primary supervised unit.
///
/// This is the tagged, explicit-optional-field record persisted by the
/// registry (see [`crate::registry`]): unknown fields on read are discarded
/// by serde's default behavior rather than rejected, so the document can
/// grow operator-only fields over time without breaking this core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub kind: AppKind,
    pub working_dir: String,
    pub port: u16,
    pub current_version: String,
    pub versions: Vec<Version>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub autorestart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<Secret<Vec<u8>>>,
    #[serde(default)]
    pub status: AppStatus,
    #[serde(default)]
    pub health: HealthRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_spec: Option<StartSpec>,
    /// Branch tracked for `git`/`webhook` deploys, used by the redeployer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
}

fn default_true() -> bool {
    true
}

impl App {
    pub fn version(&self, id: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn current_version(&self) -> Option<&Version> {
        self.version(&self.current_version)
    }

    /// A read-only view of the app safe to hand back over the wire: the
    /// webhook secret is never serialized here regardless of its own
    /// `Option`-ness, matching the invariant that it "is never returned on
    /// read paths" (§3).
    pub fn public_view(&self) -> PublicApp {
        PublicApp {
            name: self.name.clone(),
            kind: self.kind,
            working_dir: self.working_dir.clone(),
            port: self.port,
            current_version: self.current_version.clone(),
            version_count: self.versions.len(),
            env: self.env.clone(),
            autorestart: self.autorestart,
            webhook_configured: self.webhook_secret.is_some(),
            status: self.status,
            health: self.health.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicApp {
    pub name: String,
    pub kind: AppKind,
    pub working_dir: String,
    pub port: u16,
    pub current_version: String,
    pub version_count: usize,
    pub env: HashMap<String, String>,
    pub autorestart: bool,
    pub webhook_configured: bool,
    pub status: AppStatus,
    pub health: HealthRecord,
}

/// Lowercases and replaces runs of non-`[a-z0-9-]` with `-`, per §4.9 step 1.
pub fn normalize_name(requested: &str) -> String {
    let lowered = requested.to_ascii_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
