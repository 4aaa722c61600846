mod app;
mod archive;
mod classifier;
mod config;
mod deploy;
mod error;
mod git;
mod health;
mod http;
mod logs;
mod ports;
mod registry;
mod sampler;
mod supervisor;
mod versions;
mod webhook;

use std::env;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{apply_env_overrides, Config};
use http::AppState;
use logs::LogRegistry;
use registry::Registry;
use sampler::Sampler;
use supervisor::{RestartPolicy, StopPolicy, Supervisor};

fn load_config() -> anyhow::Result<Config> {
    let cfg = match env::args().len() {
        0 | 1 => Config::default(),
        2 => {
            let arg = env::args().nth(1).expect("should have arg 1");
            let contents = std::fs::read_to_string(&arg)
                .context("could not read configuration file")
                .context(arg)?;
            toml::from_str(&contents).context("failed to parse configuration")?
        }
        _ => {
            return Err(anyhow::anyhow!(
                "expected at most one command arg, pointing to a config file"
            ))
        }
    };

    Ok(apply_env_overrides(cfg))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration, if available, otherwise use a default, then layer
    // environment overrides on top.
    let cfg = load_config().context("could not load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| (&cfg.platform.log).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!(?cfg, "loaded configuration");

    // Paths persisted into app records (`working_dir`, `snapshot_dir`) are
    // documented as absolute; canonicalize the configured data directory
    // once up front so that holds regardless of how it was configured.
    tokio::fs::create_dir_all(&cfg.platform.data_dir)
        .await
        .context("could not create platform data directory")?;
    let data_dir = tokio::fs::canonicalize(&cfg.platform.data_dir)
        .await
        .context("could not canonicalize platform data directory")?;

    let apps_root = data_dir.join("apps");
    let logs_root = data_dir.join("logs");
    let registry_path = data_dir.join("data").join("apps.json");
    tokio::fs::create_dir_all(&apps_root)
        .await
        .context("could not create apps root")?;
    tokio::fs::create_dir_all(&logs_root)
        .await
        .context("could not create logs root")?;

    let registry = Arc::new(
        Registry::load(&registry_path, &apps_root, &logs_root)
            .await
            .context("could not load app registry")?,
    );
    let logs = Arc::new(LogRegistry::new());
    let supervisor = Supervisor::new(
        registry.clone(),
        logs.clone(),
        RestartPolicy {
            max: cfg.supervisor.auto_restart_max,
            window_secs: cfg.supervisor.auto_restart_window_secs,
            backoff_secs: 2,
        },
        StopPolicy::default(),
        cfg.supervisor.log_max_size_bytes(),
        cfg.supervisor.log_max_files,
    );
    let sampler = Sampler::new();

    // Apps persisted as `running` from a previous process lifetime have no
    // in-memory supervisor entry after a restart; start them back up.
    for existing in registry.list().await {
        if existing.status == app::AppStatus::Running {
            if let Err(err) = supervisor.start(&existing.name).await {
                tracing::warn!(app = %existing.name, %err, "failed to resume app on startup");
            }
        }
    }

    tokio::spawn(sampler.clone().run(supervisor.clone()));
    tokio::spawn(health::run(registry.clone(), supervisor.clone()));
    tokio::spawn(logs::run_orphan_sweep(logs_root.clone(), registry.clone()));

    let state = AppState {
        registry: registry.clone(),
        supervisor: supervisor.clone(),
        logs,
        sampler,
        port_floor: cfg.supervisor.start_port,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .merge(http::router(state))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cfg.server.bind)
        .await
        .context("failed to bind listener")?;
    info!(bind = %cfg.server.bind, "stagehand listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
        .context("http server exited with error")?;

    Ok(())
}

async fn shutdown_signal(supervisor: Supervisor) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping all apps");
    supervisor.stop_all().await;
}
