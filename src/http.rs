//! Thin operator-facing HTTP surface over the core. No authentication or
//! authorization layer of its own -- that is explicitly out of scope; this
//! exists so the core's operations are reachable and testable end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequest, Multipart, Path as AxumPath, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use sec::Secret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::app::PublicApp;
use crate::deploy::{self, Source};
use crate::error::{Result, SupervisorError};
use crate::health;
use crate::logs::LogRegistry;
use crate::registry::Registry;
use crate::sampler::Sampler;
use crate::supervisor::Supervisor;
use crate::webhook;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub supervisor: Supervisor,
    pub logs: Arc<LogRegistry>,
    pub sampler: Arc<Sampler>,
    pub port_floor: u16,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/:name", delete(delete_app))
        .route("/apps/:name/start", post(start_app))
        .route("/apps/:name/stop", post(stop_app))
        .route("/apps/:name/restart", post(restart_app))
        .route("/apps/:name/env", get(read_env).put(write_env))
        .route("/apps/:name/logs", get(read_logs))
        .route("/apps/:name/versions", get(list_versions))
        .route(
            "/apps/:name/versions/:id/rollback",
            post(rollback_version),
        )
        .route(
            "/apps/:name/webhook",
            put(set_webhook_secret).delete(clear_webhook_secret),
        )
        .route("/apps/:name/webhook", post(receive_webhook))
        .route("/apps/:name/health", get(app_health))
        .route("/health", get(platform_health))
        .with_state(state)
}

#[derive(Serialize)]
struct AppView {
    #[serde(flatten)]
    app: PublicApp,
    cpu_percent: Option<f64>,
    memory_mb: Option<f64>,
}

async fn view_for(state: &AppState, name: &str) -> Result<AppView> {
    let app = state.registry.get(name).await?.public_view();
    let snapshot = state.sampler.snapshot(name).await;
    Ok(AppView {
        app,
        cpu_percent: snapshot.map(|s| s.cpu_percent),
        memory_mb: snapshot.map(|s| s.memory_mb),
    })
}

async fn list_apps(State(state): State<AppState>) -> Result<Json<Vec<AppView>>> {
    let mut views = Vec::new();
    for app in state.registry.list().await {
        views.push(view_for(&state, &app.name).await?);
    }
    Ok(Json(views))
}

#[derive(Deserialize)]
struct GitDeployRequest {
    name: String,
    #[serde(rename = "gitUrl")]
    git_url: String,
    branch: String,
}

async fn create_app(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<PublicApp>> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (name, source) = if content_type.starts_with("multipart/form-data") {
        parse_multipart(body, &content_type).await?
    } else {
        let req: GitDeployRequest = serde_json::from_slice(&body).map_err(anyhow::Error::from)?;
        (
            req.name,
            Source::Git {
                url: req.git_url,
                branch: req.branch,
            },
        )
    };

    let app = deploy::deploy(
        &state.registry,
        &state.supervisor,
        state.port_floor,
        &name,
        source,
    )
    .await?;
    Ok(Json(app.public_view()))
}

async fn parse_multipart(body: axum::body::Bytes, content_type: &str) -> Result<(String, Source)> {
    // `Multipart` normally extracts from a live request; here the archive
    // route is driven from raw bytes plus the header, reusing axum's parser
    // via a reconstructed request.
    let request = axum::http::Request::builder()
        .header(axum::http::header::CONTENT_TYPE, content_type)
        .body(axum::body::Body::from(body))
        .map_err(anyhow::Error::from)?;

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("invalid multipart body: {e}")))?;

    let mut name = None;
    let mut archive = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("invalid multipart field: {e}")))?
    {
        match field.name() {
            Some("name") => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("{e}")))?,
                );
            }
            Some("archive") => {
                archive = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| SupervisorError::Internal(anyhow::anyhow!("{e}")))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| SupervisorError::InvalidName("<missing>".to_string()))?;
    let archive = archive
        .ok_or_else(|| SupervisorError::Internal(anyhow::anyhow!("missing archive field")))?;
    Ok((name, Source::Archive(archive)))
}

async fn delete_app(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    if state.supervisor.is_running(&name) {
        state.supervisor.stop(&name).await?;
    }
    let app = state.registry.remove(&name).await?;
    state.supervisor.forget(&name);
    state.logs.remove(&name).await;
    crate::logs::remove_for_app(state.registry.logs_root(), &name).await;
    let _ = std::fs::remove_dir_all(&app.working_dir);
    Ok(Json(json!({"removed": name})))
}

async fn start_app(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    state.supervisor.start(&name).await?;
    Ok(Json(json!({"status": "running"})))
}

async fn stop_app(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    state.supervisor.stop(&name).await?;
    Ok(Json(json!({"status": "stopped"})))
}

async fn restart_app(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    state.supervisor.restart(&name).await?;
    Ok(Json(json!({"status": "running"})))
}

async fn read_env(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<HashMap<String, String>>> {
    let app = state.registry.get(&name).await?;
    Ok(Json(app.env))
}

async fn write_env(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(env): Json<HashMap<String, String>>,
) -> Result<Json<Value>> {
    state.registry.mutate(&name, |a| a.env = env).await?;
    Ok(Json(json!({"saved": true})))
}

#[derive(Deserialize)]
struct LogQuery {
    lines: Option<usize>,
}

async fn read_logs(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<LogQuery>,
) -> Result<String> {
    state.registry.get(&name).await?;
    let path = state.registry.logs_root().join(format!("{name}.log"));
    let contents = tokio::fs::read_to_string(&path)
        .await
        .unwrap_or_default();

    let limit = query.lines.unwrap_or(200);
    let tail: Vec<&str> = contents.lines().rev().take(limit).collect();
    Ok(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
}

async fn list_versions(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    let app = state.registry.get(&name).await?;
    Ok(Json(json!({
        "current": app.current_version,
        "versions": app.versions,
    })))
}

async fn rollback_version(
    State(state): State<AppState>,
    AxumPath((name, id)): AxumPath<(String, String)>,
) -> Result<Json<Value>> {
    let app = state.registry.get(&name).await?;
    if app.current_version == id {
        return Err(SupervisorError::AlreadyAtVersion(name));
    }
    let version = app
        .version(&id)
        .cloned()
        .ok_or_else(|| SupervisorError::VersionMissing {
            app: name.clone(),
            version: id.clone(),
        })?;

    let was_running = state.supervisor.is_running(&name);
    if was_running {
        state.supervisor.stop(&name).await?;
    }

    crate::versions::restore(std::path::Path::new(&app.working_dir), &version)?;
    state
        .registry
        .mutate(&name, |a| a.current_version = id.clone())
        .await?;

    if was_running {
        state.supervisor.start(&name).await?;
    }

    Ok(Json(json!({"rolledBackTo": version.id})))
}

#[derive(Deserialize)]
struct SetWebhookRequest {
    secret: String,
}

async fn set_webhook_secret(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(req): Json<SetWebhookRequest>,
) -> Result<Json<Value>> {
    state
        .registry
        .mutate(&name, |a| {
            a.webhook_secret = Some(Secret::new(req.secret.clone().into_bytes()))
        })
        .await?;
    Ok(Json(json!({"webhookConfigured": true})))
}

async fn clear_webhook_secret(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    state
        .registry
        .mutate(&name, |a| a.webhook_secret = None)
        .await?;
    Ok(Json(json!({"webhookConfigured": false})))
}

async fn receive_webhook(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>> {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    webhook::receive(&state.registry, &state.supervisor, &name, body.to_vec(), signature).await?;
    Ok(Json(json!({"accepted": true})))
}

async fn app_health(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<Value>> {
    let app = state.registry.get(&name).await?;
    if !state.supervisor.is_running(&name) {
        return Ok(Json(json!({"status": "stopped"})));
    }
    let record = health::probe(app.port).await;
    let _ = state
        .registry
        .mutate(&name, |a| a.health = record.clone())
        .await;
    Ok(Json(serde_json::to_value(record).map_err(anyhow::Error::from)?))
}

async fn platform_health(State(state): State<AppState>) -> Json<Value> {
    let apps = state.registry.list().await;
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "registryReachable": state.registry.is_reachable(),
        "appsRootReachable": state.registry.apps_root().is_dir(),
        "appCount": apps.len(),
    }))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::RouterIntoService;
    use http_body_util::BodyExt;
    use tower::{util::ServiceExt, Service};
    use zip::write::FileOptions;

    use crate::logs::{LogRegistry, DEFAULT_MAX_FILES, DEFAULT_ROTATE_BYTES};
    use crate::supervisor::{RestartPolicy, StopPolicy, Supervisor};

    use super::*;

    struct Context {
        _tmp: tempfile::TempDir,
    }

    async fn mk_test_app(port_floor: u16) -> (Context, RouterIntoService<Body>) {
        let tmp = tempfile::tempdir().expect("could not create temporary directory");
        let apps_root = tmp.path().join("apps");
        tokio::fs::create_dir_all(&apps_root).await.unwrap();

        let logs_root = tmp.path().join("logs");
        let registry = Arc::new(
            Registry::load(tmp.path().join("data/apps.json"), &apps_root, &logs_root)
                .await
                .expect("registry should load"),
        );
        let logs = Arc::new(LogRegistry::new());
        let supervisor = Supervisor::new(
            registry.clone(),
            logs.clone(),
            RestartPolicy::default(),
            StopPolicy::default(),
            DEFAULT_ROTATE_BYTES,
            DEFAULT_MAX_FILES,
        );
        let sampler = Sampler::new();

        let state = AppState {
            registry,
            supervisor,
            logs,
            sampler,
            port_floor,
            started_at: Instant::now(),
        };

        (Context { _tmp: tmp }, router(state).into_service::<Body>())
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, contents) in entries {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    fn multipart_body(boundary: &str, name: &str, archive: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"name\"\r\n\r\n");
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"archive\"; filename=\"site.zip\"\r\n\
              Content-Type: application/zip\r\n\r\n",
        );
        body.extend_from_slice(archive);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    async fn deploy_static_site(
        app: &mut RouterIntoService<Body>,
        name: &str,
    ) -> PublicApp {
        let zip_bytes = build_zip(&[("index.html", b"<html>hi</html>")]);
        let boundary = "stagehand-test-boundary";
        let body = multipart_body(boundary, name, &zip_bytes);

        let response = app
            .call(
                Request::builder()
                    .method("POST")
                    .uri("/apps")
                    .header(
                        axum::http::header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn platform_health_reports_zero_apps_initially() {
        let (_ctx, mut service) = mk_test_app(18100).await;
        let app = service.ready().await.expect("service should be ready");

        let response = app
            .call(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["appCount"], 0);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn deploying_a_static_archive_registers_and_starts_the_app() {
        let (_ctx, mut service) = mk_test_app(18200).await;
        let app = service.ready().await.expect("service should be ready");

        let deployed = deploy_static_site(app, "my-site").await;
        assert_eq!(deployed.name, "my-site");
        assert_eq!(deployed.kind, crate::app::AppKind::Static);
        assert!(deployed.port >= 18200);
        assert_eq!(deployed.status, crate::app::AppStatus::Running);
    }

    #[tokio::test]
    async fn rollback_to_current_version_is_rejected() {
        let (_ctx, mut service) = mk_test_app(18300).await;
        let app = service.ready().await.expect("service should be ready");

        let deployed = deploy_static_site(app, "rollback-demo").await;

        let versions_response = app
            .call(
                Request::builder()
                    .uri(format!("/apps/{}/versions", deployed.name))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = versions_response.into_body().collect().await.unwrap().to_bytes();
        let listed: Value = serde_json::from_slice(&body).unwrap();
        let current = listed["current"].as_str().unwrap().to_string();

        let response = app
            .call(
                Request::builder()
                    .method("POST")
                    .uri(format!(
                        "/apps/{}/versions/{}/rollback",
                        deployed.name, current
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn deleting_an_app_removes_it_from_the_listing() {
        let (_ctx, mut service) = mk_test_app(18400).await;
        let app = service.ready().await.expect("service should be ready");

        let deployed = deploy_static_site(app, "ephemeral").await;

        let response = app
            .call(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/apps/{}", deployed.name))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let listing = app
            .call(Request::builder().uri("/apps").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = listing.into_body().collect().await.unwrap().to_bytes();
        let apps: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert!(apps.is_empty());
    }
}
