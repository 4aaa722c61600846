//! Process Supervisor: owns the running/stopped lifecycle of every app, the
//! crash-restart policy, and the per-app operation ordering guarantee.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::app::{AppKind, AppStatus, StartSpec};
use crate::error::{Result, SupervisorError};
use crate::logs::{LogRegistry, Origin};
use crate::registry::Registry;

/// How long a process must run without exiting before its restart counter
/// is cleared.
const STABLE_RUN_SECS: u64 = 30;

/// Policy knobs carried in from the platform config, per §4.6/§6.
#[derive(Clone, Copy, Debug)]
pub struct RestartPolicy {
    pub max: u32,
    pub window_secs: u64,
    pub backoff_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max: 5,
            window_secs: 60,
            backoff_secs: 2,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StopPolicy {
    pub grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct RestartCounter {
    count: u32,
    window_start: Option<Instant>,
}

impl RestartCounter {
    fn clear(&mut self) {
        self.count = 0;
        self.window_start = None;
    }

    /// Returns `true` if a restart should be attempted, bumping the counter
    /// as a side effect; `false` if the policy says to give up.
    fn record_attempt(&mut self, policy: &RestartPolicy) -> bool {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start).as_secs() <= policy.window_secs => {}
            _ => {
                self.count = 0;
                self.window_start = Some(now);
            }
        }

        if self.count >= policy.max {
            return false;
        }

        self.count += 1;
        true
    }
}

enum Control {
    Stop(oneshot::Sender<()>),
}

struct RunningChild {
    pid: Option<u32>,
    generation: u64,
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    running: Option<RunningChild>,
    restart: RestartCounter,
}

/// Shared supervisor state. Cloned cheaply (everything behind an `Arc`) and
/// handed to the HTTP layer and background watchers alike.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    logs: Arc<LogRegistry>,
    restart_policy: RestartPolicy,
    stop_policy: StopPolicy,
    log_rotate_bytes: u64,
    log_max_files: u32,
    next_generation: AtomicU64,
    slots: SyncMutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        logs: Arc<LogRegistry>,
        restart_policy: RestartPolicy,
        stop_policy: StopPolicy,
        log_rotate_bytes: u64,
        log_max_files: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                logs,
                restart_policy,
                stop_policy,
                log_rotate_bytes,
                log_max_files,
                next_generation: AtomicU64::new(0),
                slots: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Rotation threshold the supervisor opens per-app logs with, per the
    /// platform config (`PAAS_LOG_MAX_SIZE_MIB`). Used by callers that open
    /// an [`crate::logs::AppLog`] directly outside of `start()` (the
    /// deployment pipeline and the webhook redeployer).
    pub fn log_rotate_bytes(&self) -> u64 {
        self.inner.log_rotate_bytes
    }

    /// Backlog file count the supervisor opens per-app logs with, per the
    /// platform config (`PAAS_LOG_MAX_FILES`).
    pub fn log_max_files(&self) -> u32 {
        self.inner.log_max_files
    }

    fn slot_for(&self, name: &str) -> Arc<AsyncMutex<Slot>> {
        let mut slots = self.inner.slots.lock().expect("slots lock poisoned");
        slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(Slot::default())))
            .clone()
    }

    /// Drops the bookkeeping slot for an app entirely. Callers must ensure
    /// the app is stopped first; this is only safe to call as part of
    /// removing the app from the registry.
    pub fn forget(&self, name: &str) {
        self.inner.slots.lock().expect("slots lock poisoned").remove(name);
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let slot_lock = self.slot_for(name);
        let mut slot = slot_lock.lock().await;
        self.start_locked(name, &mut slot).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let slot_lock = self.slot_for(name);
        let mut slot = slot_lock.lock().await;
        self.stop_locked(name, &mut slot).await
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let slot_lock = self.slot_for(name);
        let mut slot = slot_lock.lock().await;
        if slot.running.is_some() {
            self.stop_locked(name, &mut slot).await?;
        }
        self.start_locked(name, &mut slot).await
    }

    pub fn is_running(&self, name: &str) -> bool {
        let slots = self.inner.slots.lock().expect("slots lock poisoned");
        slots
            .get(name)
            .map(|s| s.try_lock().map(|g| g.running.is_some()).unwrap_or(true))
            .unwrap_or(false)
    }

    /// Snapshot of `{app name -> os pid}` for every currently running app,
    /// for the resource sampler. Static apps (no OS child) are omitted.
    pub async fn running_pids(&self) -> HashMap<String, u32> {
        let slot_locks: Vec<(String, Arc<AsyncMutex<Slot>>)> = self
            .inner
            .slots
            .lock()
            .expect("slots lock poisoned")
            .iter()
            .map(|(name, lock)| (name.clone(), lock.clone()))
            .collect();

        let mut pids = HashMap::new();
        for (name, lock) in slot_locks {
            if let Some(running) = &lock.lock().await.running {
                if let Some(pid) = running.pid {
                    pids.insert(name, pid);
                }
            }
        }
        pids
    }

    /// Stops every running app with grace, for platform shutdown. Best
    /// effort: logs and continues past individual failures.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self
            .inner
            .slots
            .lock()
            .expect("slots lock poisoned")
            .keys()
            .cloned()
            .collect();

        for name in names {
            if let Err(err) = self.stop(&name).await {
                warn!(%name, %err, "error stopping app during shutdown");
            }
        }
    }

    async fn start_locked(&self, name: &str, slot: &mut Slot) -> Result<()> {
        if slot.running.is_some() {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }

        let app = self.inner.registry.get(name).await?;

        let working_dir = PathBuf::from(&app.working_dir);
        if !working_dir.is_dir() {
            return Err(SupervisorError::WorkingDirGone(name.to_string()));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (control_tx, control_rx) = mpsc::channel(1);
        let log = self
            .inner
            .logs
            .get_or_open(
                name,
                self.inner.registry.logs_root(),
                self.inner.log_rotate_bytes,
                self.inner.log_max_files,
            )
            .await?;

        let pid = match app.kind {
            AppKind::Node => {
                let spec = app.start_spec.clone().unwrap_or_default();
                let child = spawn_child(&spec, &working_dir, app.port, &app.env)?;
                let pid = child.id();
                let task = tokio::spawn(run_node_child(
                    self.clone(),
                    name.to_string(),
                    generation,
                    child,
                    log.clone(),
                    control_rx,
                ));
                slot.running = Some(RunningChild {
                    pid,
                    generation,
                    control: control_tx,
                    task,
                });
                pid
            }
            AppKind::Static => {
                log.append_exit_line(&format!("serving static files on port {}", app.port))
                    .await?;
                let listener = TcpListener::bind(("127.0.0.1", app.port))
                    .await
                    .map_err(anyhow::Error::from)?;
                let task = tokio::spawn(run_static_child(
                    self.clone(),
                    name.to_string(),
                    generation,
                    listener,
                    working_dir.clone(),
                    log.clone(),
                    control_rx,
                ));
                slot.running = Some(RunningChild {
                    pid: None,
                    generation,
                    control: control_tx,
                    task,
                });
                None
            }
        };

        info!(app = name, ?pid, "app started");
        self.inner
            .registry
            .mutate(name, |a| a.status = AppStatus::Running)
            .await?;

        self.schedule_stabilization(name, generation);
        Ok(())
    }

    async fn stop_locked(&self, name: &str, slot: &mut Slot) -> Result<()> {
        let Some(running) = slot.running.take() else {
            return Err(SupervisorError::NotRunning(name.to_string()));
        };

        slot.restart.clear();
        self.inner
            .registry
            .mutate(name, |a| a.status = AppStatus::Stopping)
            .await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if running.control.send(Control::Stop(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        let _ = running.task.await;

        self.inner
            .registry
            .mutate(name, |a| a.status = AppStatus::Stopped)
            .await?;
        self.inner.logs.remove(name).await;
        info!(app = name, "app stopped");
        Ok(())
    }

    fn schedule_stabilization(&self, name: &str, generation: u64) {
        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(STABLE_RUN_SECS)).await;
            let slot_lock = supervisor.slot_for(&name);
            let mut slot = slot_lock.lock().await;
            if let Some(running) = &slot.running {
                if running.generation == generation {
                    slot.restart.clear();
                }
            }
        });
    }

    /// Called by a child/static watcher task when its process ends on its
    /// own (not via an explicit Stop). Applies the crash-restart policy.
    /// `Crashed` is only ever persisted once restart is either not
    /// attempted (a clean exit, or `autorestart` disabled) turns out not to
    /// apply, or the restart budget is exhausted -- a clean exit or a
    /// restart still in progress leaves the app `Stopped`, never `Crashed`.
    async fn handle_unexpected_exit(&self, name: &str, generation: u64, success: bool) {
        let slot_lock = self.slot_for(name);
        let mut slot = slot_lock.lock().await;

        let still_current = slot
            .running
            .as_ref()
            .map(|r| r.generation == generation)
            .unwrap_or(false);
        if !still_current {
            // A Stop already raced us and cleared this slot.
            return;
        }
        slot.running = None;

        let app = match self.inner.registry.get(name).await {
            Ok(app) => app,
            Err(err) => {
                error!(app = name, %err, "app vanished from registry after exit");
                return;
            }
        };

        if success || !app.autorestart {
            if let Err(err) = self
                .inner
                .registry
                .mutate(name, |a| a.status = AppStatus::Stopped)
                .await
            {
                error!(app = name, %err, "failed to persist stopped status");
            }
            return;
        }

        if !slot.restart.record_attempt(&self.inner.restart_policy) {
            if let Err(err) = self
                .inner
                .registry
                .mutate(name, |a| a.status = AppStatus::Crashed)
                .await
            {
                error!(app = name, %err, "failed to persist crashed status");
            }
            warn!(app = name, "restart limit reached, giving up until manual start");
            return;
        }

        let backoff = self.inner.restart_policy.backoff_secs;
        drop(slot);
        tokio::time::sleep(Duration::from_secs(backoff)).await;

        let mut slot = slot_lock.lock().await;
        if let Err(err) = self.start_locked(name, &mut slot).await {
            error!(app = name, %err, "automatic restart failed");
            if let Err(err) = self
                .inner
                .registry
                .mutate(name, |a| a.status = AppStatus::Crashed)
                .await
            {
                error!(app = name, %err, "failed to persist crashed status");
            }
        }
    }
}

fn spawn_child(
    spec: &StartSpec,
    working_dir: &std::path::Path,
    port: u16,
    env: &HashMap<String, String>,
) -> Result<Child> {
    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .current_dir(working_dir)
        .envs(env)
        .env("PORT", port.to_string())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    command.spawn().map_err(|e| {
        SupervisorError::Internal(anyhow::anyhow!("failed to spawn child process: {e}"))
    })
}

async fn run_node_child(
    supervisor: Supervisor,
    name: String,
    generation: u64,
    mut child: Child,
    log: Arc<crate::logs::AppLog>,
    mut control_rx: mpsc::Receiver<Control>,
) {
    if let Some(stdout) = child.stdout.take() {
        let log = log.clone();
        tokio::spawn(drain_stream(stdout, log, Origin::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        let log = log.clone();
        tokio::spawn(drain_stream(stderr, log, Origin::Stderr));
    }

    tokio::select! {
        ctrl = control_rx.recv() => {
            if let Some(Control::Stop(ack)) = ctrl {
                terminate_gracefully(&supervisor, &mut child).await;
                let _ = log.append_exit_line("stopped").await;
                let _ = ack.send(());
            }
        }
        status = child.wait() => {
            let success = matches!(status, Ok(s) if s.success());
            let _ = log.append_exit_line(&describe_exit(status)).await;
            supervisor.handle_unexpected_exit(&name, generation, success).await;
        }
    }
}

async fn run_static_child(
    supervisor: Supervisor,
    name: String,
    generation: u64,
    listener: TcpListener,
    root: PathBuf,
    log: Arc<crate::logs::AppLog>,
    mut control_rx: mpsc::Receiver<Control>,
) {
    let app = axum::Router::new().fallback_service(ServeDir::new(root));
    let serve = axum::serve(listener, app.into_make_service());

    tokio::select! {
        ctrl = control_rx.recv() => {
            if let Some(Control::Stop(ack)) = ctrl {
                let _ = log.append_exit_line("stopped").await;
                let _ = ack.send(());
            }
        }
        result = serve.into_future() => {
            let success = result.is_ok();
            if let Err(err) = result {
                let _ = log.append_exit_line(&format!("static server ended: {err}")).await;
            }
            supervisor.handle_unexpected_exit(&name, generation, success).await;
        }
    }
}

async fn terminate_gracefully(supervisor: &Supervisor, child: &mut Child) {
    let grace = supervisor.inner.stop_policy.grace;
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
        let _ = child.wait().await;
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => format!("process exited with {status}"),
        Err(err) => format!("failed to reap process: {err}"),
    }
}

async fn drain_stream<R>(reader: R, log: Arc<crate::logs::AppLog>, origin: Origin)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(err) = log.append(origin, &line).await {
                    error!(%err, "failed to write log line");
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "error reading child output stream");
                break;
            }
        }
    }
}
