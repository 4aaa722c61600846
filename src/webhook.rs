//! Webhook Redeployer: verifies an inbound push notification and, if it
//! targets the app's tracked branch, redeploys in the background.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info};

use crate::app::DeployMethod;
use crate::deploy;
use crate::error::{Result, SupervisorError};
use crate::logs::{AppLog, Origin};
use crate::registry::Registry;
use crate::supervisor::Supervisor;

type HmacSha256 = Hmac<Sha256>;

/// Minimal shape shared by GitHub- and GitLab-style push events: only the
/// `ref` field is read, everything else is ignored.
#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

/// Verifies `signature_header` (`sha256=<hex>`) against `body` using the
/// app's secret, in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> Result<()> {
    let hex_digest = signature_header
        .strip_prefix("sha256=")
        .ok_or(SupervisorError::InvalidWebhookSignature)?;

    let expected =
        hex::decode(hex_digest).map_err(|_| SupervisorError::InvalidWebhookSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SupervisorError::InvalidWebhookSignature)?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if constant_time_eq::constant_time_eq(&computed, &expected) {
        Ok(())
    } else {
        Err(SupervisorError::InvalidWebhookSignature)
    }
}

/// `true` if the push event's ref matches `branch` (`refs/heads/<branch>`).
/// A body that doesn't parse, or targets another branch, is not an error --
/// the caller should simply skip the redeploy.
fn targets_branch(body: &[u8], branch: &str) -> bool {
    let Ok(event) = serde_json::from_slice::<PushEvent>(body) else {
        return false;
    };
    event.git_ref.as_deref() == Some(&format!("refs/heads/{branch}"))
}

/// Handles a webhook delivery: verifies the signature, checks the branch,
/// and if it matches, spawns the redeploy as a background task so the HTTP
/// handler can acknowledge promptly.
pub async fn receive(
    registry: &Arc<Registry>,
    supervisor: &Supervisor,
    name: &str,
    body: Vec<u8>,
    signature_header: Option<&str>,
) -> Result<()> {
    let app = registry.get(name).await?;
    let secret = app
        .webhook_secret
        .as_ref()
        .ok_or_else(|| SupervisorError::WebhookNotConfigured(name.to_string()))?;

    let signature_header = signature_header.ok_or(SupervisorError::InvalidWebhookSignature)?;
    verify_signature(secret.as_slice(), &body, signature_header)?;

    let Some(source) = app.source.clone() else {
        info!(app = name, "webhook received but app has no tracked source, ignoring");
        return Ok(());
    };

    if !targets_branch(&body, &source.branch) {
        info!(app = name, branch = %source.branch, "webhook ref did not match tracked branch");
        return Ok(());
    }

    let registry = registry.clone();
    let supervisor = supervisor.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(err) = redeploy(&registry, &supervisor, &name).await {
            error!(app = %name, %err, "webhook-triggered redeploy failed");
        }
    });

    Ok(())
}

async fn redeploy(registry: &Registry, supervisor: &Supervisor, name: &str) -> Result<()> {
    let app = registry.get(name).await?;
    let source = app
        .source
        .clone()
        .ok_or_else(|| SupervisorError::Internal(anyhow::anyhow!("app has no tracked source")))?;
    let working_dir = std::path::PathBuf::from(&app.working_dir);

    let log = AppLog::open(
        registry.logs_root(),
        name,
        supervisor.log_rotate_bytes(),
        supervisor.log_max_files(),
    )?;

    if supervisor.is_running(name) {
        supervisor.stop(name).await?;
    }

    log.append(Origin::System, "webhook redeploy: pulling latest")
        .await?;
    crate::git::pull_latest(&working_dir, &source.branch, &log).await?;
    let commit = crate::git::short_head(&working_dir).await?;

    let classification = crate::classifier::classify(&working_dir)?;
    if classification.kind == crate::app::AppKind::Node {
        let (command, args) = crate::classifier::install_command(&classification.root_path);
        log.append(
            Origin::System,
            &format!("webhook redeploy: reinstalling dependencies via {command}"),
        )
        .await?;
        let output = tokio::process::Command::new(&command)
            .args(&args)
            .current_dir(&classification.root_path)
            .output()
            .await
            .map_err(anyhow::Error::from)?;
        if !output.status.success() {
            return Err(SupervisorError::InstallFailed(format!(
                "{command} exited with {}",
                output.status
            )));
        }
    }

    let new_source = crate::app::SourceRef {
        git_url: source.git_url.clone(),
        branch: source.branch.clone(),
        commit,
    };
    registry
        .mutate(name, |a| a.source = Some(new_source.clone()))
        .await?;

    deploy::snapshot_and_advance(registry, name, DeployMethod::Webhook, Some(new_source)).await?;

    supervisor.start(name).await?;
    log.append(Origin::System, "webhook redeploy: complete")
        .await?;
    Ok(())
}
