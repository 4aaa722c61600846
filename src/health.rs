//! Health Prober: periodically (and on demand) checks whether a running
//! app answers HTTP on its assigned port.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tracing::warn;

use crate::app::{App, HealthRecord, HealthStatus};
use crate::registry::Registry;
use crate::supervisor::Supervisor;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes one app's port and returns the resulting record. Does not touch
/// the registry; callers decide whether and how to persist it.
pub async fn probe(port: u16) -> HealthRecord {
    let started = Instant::now();
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

    let outcome = tokio::time::timeout(PROBE_TIMEOUT, probe_http(addr)).await;
    let response_time_ms = started.elapsed().as_millis() as u64;

    let status = match outcome {
        Ok(Ok(true)) => HealthStatus::Healthy,
        Ok(Ok(false)) | Ok(Err(_)) | Err(_) => HealthStatus::Unhealthy,
    };

    HealthRecord {
        status,
        last_check_unix_ms: Some(unix_millis()),
        response_time_ms: Some(response_time_ms),
    }
}

/// Connects and issues a bare-bones `GET /`, returning whether the status
/// line reported 2xx/3xx.
async fn probe_http(addr: SocketAddr) -> anyhow::Result<bool> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf[..n]);

    let status_code = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());

    Ok(matches!(status_code, Some(code) if (200..400).contains(&code)))
}

/// Runs the periodic sweep forever: probes every registered app once per
/// interval, persisting a single registry save per sweep rather than one
/// per app.
pub async fn run(registry: Arc<Registry>, supervisor: Supervisor) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        sweep_once(&registry, &supervisor).await;
    }
}

async fn sweep_once(registry: &Arc<Registry>, supervisor: &Supervisor) {
    let mut mutations: Vec<(String, Box<dyn FnOnce(&mut App) + Send>)> = Vec::new();

    for app in registry.list().await {
        let record = if !supervisor.is_running(&app.name) {
            HealthRecord {
                status: HealthStatus::Stopped,
                last_check_unix_ms: Some(unix_millis()),
                response_time_ms: None,
            }
        } else {
            probe(app.port).await
        };

        // Health is informational and never overrides lifecycle status,
        // which the supervisor alone owns.
        mutations.push((app.name, Box::new(move |a: &mut App| a.health = record)));
    }

    if let Err(err) = registry.mutate_many(mutations).await {
        warn!(%err, "failed to persist health sweep");
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as u64
}
