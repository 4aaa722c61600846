//! Resource Sampler: periodically reads CPU% and RSS for every supervised
//! child directly from `/proc`, without shelling out to `ps`.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::supervisor::Supervisor;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Default)]
struct Previous {
    total_jiffies: u64,
    at: Option<Instant>,
}

/// Holds the most recent snapshot per app, plus the bookkeeping needed to
/// compute CPU percent from two consecutive `/proc/<pid>/stat` readings.
/// Never persisted; `list apps` and the per-app status endpoint read this
/// directly.
#[derive(Default)]
pub struct Sampler {
    snapshots: Mutex<HashMap<String, ResourceSnapshot>>,
    previous: Mutex<HashMap<String, Previous>>,
}

impl Sampler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn snapshot(&self, name: &str) -> Option<ResourceSnapshot> {
        self.snapshots.lock().await.get(name).copied()
    }

    pub async fn all_snapshots(&self) -> HashMap<String, ResourceSnapshot> {
        self.snapshots.lock().await.clone()
    }

    /// Runs the sample loop forever; intended to be spawned as a background
    /// task for the lifetime of the process.
    pub async fn run(self: Arc<Self>, supervisor: Supervisor) {
        let clock_ticks = clock_ticks_per_sec();
        let page_size = page_size_bytes();

        loop {
            tokio::time::sleep(SAMPLE_INTERVAL).await;
            let pids = supervisor.running_pids().await;

            let mut live = std::collections::HashSet::new();
            for (name, pid) in &pids {
                live.insert(name.clone());
                match sample_one(*pid, page_size) {
                    Ok((total_jiffies, memory_mb)) => {
                        self.record(name, total_jiffies, memory_mb, clock_ticks).await;
                    }
                    Err(err) => {
                        // The process may have exited between the snapshot
                        // and our read; the supervisor owns that transition.
                        debug!(app = %name, %err, "resource sample failed");
                    }
                }
            }

            self.prune(&live).await;
        }
    }

    async fn record(&self, name: &str, total_jiffies: u64, memory_mb: f64, clock_ticks: u64) {
        let now = Instant::now();
        let mut previous = self.previous.lock().await;
        let prev = previous.entry(name.to_string()).or_default();

        let cpu_percent = match prev.at {
            Some(prev_at) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                let jiffy_delta = total_jiffies.saturating_sub(prev.total_jiffies) as f64;
                if elapsed > 0.0 {
                    (jiffy_delta / clock_ticks as f64 / elapsed) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        prev.total_jiffies = total_jiffies;
        prev.at = Some(now);

        self.snapshots.lock().await.insert(
            name.to_string(),
            ResourceSnapshot {
                cpu_percent,
                memory_mb,
            },
        );
    }

    async fn prune(&self, live: &std::collections::HashSet<String>) {
        self.snapshots.lock().await.retain(|k, _| live.contains(k));
        self.previous.lock().await.retain(|k, _| live.contains(k));
    }
}

/// Reads `/proc/<pid>/stat` (for utime+stime, fields 14 and 15) and
/// `/proc/<pid>/status` (for `VmRSS`), returning `(total_jiffies, memory_mb)`.
fn sample_one(pid: u32, page_size: u64) -> anyhow::Result<(u64, f64)> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let total_jiffies = parse_total_jiffies(&stat)?;

    let status = fs::read_to_string(format!("/proc/{pid}/status"))?;
    let rss_kb = parse_vm_rss_kb(&status)?;
    let _ = page_size; // VmRSS in /proc/status is already in kB, not pages.

    Ok((total_jiffies, rss_kb as f64 / 1024.0))
}

/// `/proc/<pid>/stat` has a process name field that may itself contain
/// spaces and parentheses, so fields are counted from the last `)` rather
/// than split naively on whitespace.
fn parse_total_jiffies(stat: &str) -> anyhow::Result<u64> {
    let after_name = stat
        .rfind(')')
        .ok_or_else(|| anyhow::anyhow!("malformed /proc/<pid>/stat: no ')'"))?;
    let fields: Vec<&str> = stat[after_name + 1..].split_whitespace().collect();

    // Field indices below are 1-based from `pid`'s position at field 1;
    // after the ')' the next field is field 3 (state). utime is field 14,
    // stime is field 15, so relative to this slice (starting at field 3)
    // they are indices 11 and 12.
    let utime: u64 = fields
        .get(11)
        .ok_or_else(|| anyhow::anyhow!("missing utime field"))?
        .parse()?;
    let stime: u64 = fields
        .get(12)
        .ok_or_else(|| anyhow::anyhow!("missing stime field"))?
        .parse()?;

    Ok(utime + stime)
}

fn parse_vm_rss_kb(status: &str) -> anyhow::Result<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits
                .parse()
                .map_err(|_| anyhow::anyhow!("malformed VmRSS line"));
        }
    }
    Err(anyhow::anyhow!("no VmRSS line in /proc/<pid>/status"))
}

fn clock_ticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

fn page_size_bytes() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}
