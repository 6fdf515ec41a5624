//! Isolated plugin worker process management.
//!
//! One worker process hosts every process-isolated plugin. The manager
//! owns the message channel to it:
//!
//! - outbound requests are correlated by id (see [`RequestTracker`]) and
//!   bounded by per-request timeouts
//! - readiness is a gate: nothing is dispatched until the worker's
//!   `ready` handshake, and the gate drops the moment the process exits
//! - an unexpected exit rejects every pending request, emits an event,
//!   and relaunches the worker while the retry budget lasts
//! - shutdown is a best-effort `shutdown` message followed by a forced
//!   kill after the grace period
//!
//! The actual process is behind [`WorkerLauncher`], so tests drive the
//! manager with scripted in-memory workers.

use crate::correlation::{ReplyError, RequestTracker};
use crate::error::{HostResult, PluginHostError};
use crate::permissions::Permission;
use crate::protocol::{
    ActivatePayload, CallPayload, HostMessage, LogLevel, WorkerMessage, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// How the worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Process exit code; `None` when killed by a signal.
    pub code: Option<i32>,
}

impl WorkerExit {
    /// Whether this was a clean exit.
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Control handle over a launched worker.
///
/// `wait` must be cancel-safe and callable again after cancellation: the
/// manager may drop an in-flight wait to issue `start_kill`, then wait
/// once more for the resulting exit.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Waits for the worker to exit.
    async fn wait(&mut self) -> WorkerExit;

    /// Begins forceful termination; the exit is observed through `wait`.
    fn start_kill(&mut self);
}

/// A launched worker: its stdio plus a control handle.
pub struct WorkerProcess {
    /// Host-to-worker message stream.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker-to-host message stream.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Wait/kill control.
    pub handle: Box<dyn WorkerHandle>,
}

/// Launches worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> HostResult<WorkerProcess>;
}

/// Launches the worker as a real child process with piped stdio.
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self) -> HostResult<WorkerProcess> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginHostError::WorkerLaunchFailed(format!("{}: {e}", self.program.display()))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PluginHostError::WorkerLaunchFailed("failed to capture worker stdin".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PluginHostError::WorkerLaunchFailed("failed to capture worker stdout".into())
        })?;

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            handle: Box::new(ChildHandle { child }),
        })
    }
}

struct ChildHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl WorkerHandle for ChildHandle {
    async fn wait(&mut self) -> WorkerExit {
        match self.child.wait().await {
            Ok(status) => WorkerExit {
                code: status.code(),
            },
            Err(e) => {
                warn!(error = %e, "failed to await worker exit");
                WorkerExit { code: None }
            }
        }
    }

    fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Configuration for the process manager.
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Deadline for ordinary request replies.
    pub request_timeout: Duration,
    /// Deadline for ping replies.
    pub ping_timeout: Duration,
    /// How long shutdown waits before force-killing.
    pub shutdown_grace: Duration,
    /// Automatic relaunch budget after unexpected exits.
    pub max_restart_attempts: u32,
    /// Fixed delay between relaunch attempts.
    pub restart_delay: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            max_restart_attempts: 3,
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Lifecycle events emitted by the manager.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The worker completed its ready handshake.
    Ready,
    /// The worker exited; `restarting` reports whether an automatic
    /// relaunch is scheduled.
    Exited { exit: WorkerExit, restarting: bool },
}

struct ManagerInner {
    launcher: Arc<dyn WorkerLauncher>,
    config: ProcessManagerConfig,
    tracker: RequestTracker<Option<serde_json::Value>>,
    ready: watch::Sender<bool>,
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    /// Kill trigger for the currently live worker.
    kill: Mutex<Option<oneshot::Sender<()>>>,
    /// Set during an intentional stop; suppresses crash recovery.
    stopping: AtomicBool,
    restart_attempts: AtomicU32,
    events: broadcast::Sender<WorkerEvent>,
}

/// Manages the single isolated plugin worker process.
///
/// Cheap to clone; clones share the same worker.
#[derive(Clone)]
pub struct PluginProcessManager {
    inner: Arc<ManagerInner>,
}

impl PluginProcessManager {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: ProcessManagerConfig) -> Self {
        let (ready, _) = watch::channel(false);
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(ManagerInner {
                launcher,
                config,
                tracker: RequestTracker::new(),
                ready,
                writer: Mutex::new(None),
                kill: Mutex::new(None),
                stopping: AtomicBool::new(false),
                restart_attempts: AtomicU32::new(0),
                events,
            }),
        }
    }

    /// Whether the worker has completed its ready handshake.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Requests currently awaiting worker replies.
    pub fn pending_requests(&self) -> usize {
        self.inner.tracker.pending_count()
    }

    /// Launches the worker and waits for its ready handshake.
    ///
    /// Resets the crash-retry budget; this is the only way to recover a
    /// manager whose budget is exhausted.
    pub async fn start(&self) -> HostResult<()> {
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.restart_attempts.store(0, Ordering::SeqCst);
        self.spawn_worker().await?;
        self.wait_ready(self.inner.config.request_timeout).await
    }

    /// Activates a plugin inside the worker, shipping its source and
    /// granted permissions.
    pub async fn activate_plugin(
        &self,
        plugin_id: &str,
        source: String,
        permissions: Vec<Permission>,
    ) -> HostResult<()> {
        let plugin_id = plugin_id.to_string();
        self.send_request(
            move |id| HostMessage::Activate {
                id,
                plugin_id,
                data: ActivatePayload {
                    source,
                    permissions,
                },
            },
            self.inner.config.request_timeout,
        )
        .await
        .map(|_| ())
    }

    /// Deactivates a plugin inside the worker.
    pub async fn deactivate_plugin(&self, plugin_id: &str) -> HostResult<()> {
        let plugin_id = plugin_id.to_string();
        self.send_request(
            move |id| HostMessage::Deactivate { id, plugin_id },
            self.inner.config.request_timeout,
        )
        .await
        .map(|_| ())
    }

    /// Invokes an exported plugin method and returns its result.
    pub async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: serde_json::Value,
    ) -> HostResult<Option<serde_json::Value>> {
        let plugin_id = plugin_id.to_string();
        let method = method.to_string();
        self.send_request(
            move |id| HostMessage::Call {
                id,
                plugin_id,
                data: CallPayload { method, args },
            },
            self.inner.config.request_timeout,
        )
        .await
    }

    /// Liveness probe with the shorter ping deadline.
    pub async fn ping(&self) -> HostResult<()> {
        self.send_request(
            |id| HostMessage::Ping { id },
            self.inner.config.ping_timeout,
        )
        .await
        .map(|_| ())
    }

    /// Orderly shutdown: best-effort `shutdown` message, then force-kill
    /// once the grace period lapses, acknowledged or not.
    pub async fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let mut events = self.inner.events.subscribe();

        if self.inner.writer.lock().await.is_none() {
            return;
        }

        if self.is_ready() {
            let (id, rx) = self.inner.tracker.register();
            drop(rx);
            self.inner.tracker.forget(id);
            if let Err(e) = self.write_message(&HostMessage::Shutdown { id }).await {
                debug!(error = %e, "shutdown message not delivered");
            }
        }

        if wait_for_exit(&mut events, self.inner.config.shutdown_grace).await {
            info!("plugin worker shut down cleanly");
            return;
        }

        warn!("plugin worker ignored shutdown; killing");
        if let Some(kill) = self.inner.kill.lock().await.take() {
            let _ = kill.send(());
        }
        wait_for_exit(&mut events, self.inner.config.shutdown_grace).await;
    }

    // ================================================================
    // Internals
    // ================================================================

    async fn wait_ready(&self, timeout: Duration) -> HostResult<()> {
        let mut rx = self.inner.ready.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(PluginHostError::WorkerExited),
            Err(_) => Err(PluginHostError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn send_request(
        &self,
        build: impl FnOnce(u64) -> HostMessage,
        timeout: Duration,
    ) -> HostResult<Option<serde_json::Value>> {
        if !self.is_ready() {
            return Err(PluginHostError::WorkerNotReady);
        }
        let (id, rx) = self.inner.tracker.register();
        let message = build(id);
        if let Err(e) = self.write_message(&message).await {
            self.inner.tracker.forget(id);
            return Err(e);
        }
        self.inner
            .tracker
            .wait(id, rx, timeout)
            .await
            .map_err(reply_error_to_host)
    }

    async fn write_message(&self, message: &HostMessage) -> HostResult<()> {
        let mut json = serde_json::to_string(message)?;
        json.push('\n');
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.write_all(json.as_bytes()).await?;
                w.flush().await?;
                Ok(())
            }
            None => Err(PluginHostError::WorkerExited),
        }
    }

    // Returns a concrete boxed future rather than an opaque `impl Future`
    // so its `Send`-ness is named by the return type; this breaks the
    // async-recursion inference cycle (spawn_worker -> on_exit ->
    // spawn_worker) that otherwise makes the spawned monitor task non-`Send`.
    fn spawn_worker(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HostResult<()>> + Send + '_>> {
        Box::pin(async move {
            let WorkerProcess {
                stdin,
                stdout,
                handle,
            } = self.inner.launcher.launch().await?;

            *self.inner.writer.lock().await = Some(stdin);
            let (kill_tx, kill_rx) = oneshot::channel();
            *self.inner.kill.lock().await = Some(kill_tx);

            let reader_inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => handle_worker_line(&reader_inner, &line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "failed to read from worker");
                            break;
                        }
                    }
                }
                debug!("worker stdout closed");
            });

            let monitor = self.clone();
            tokio::spawn(async move {
                let exit = wait_with_kill(handle, kill_rx).await;
                monitor.on_exit(exit).await;
            });

            info!("plugin worker launched");
            Ok(())
        })
    }

    async fn on_exit(&self, exit: WorkerExit) {
        let _ = self.inner.ready.send(false);
        *self.inner.writer.lock().await = None;
        *self.inner.kill.lock().await = None;

        self.inner
            .tracker
            .reject_all(&ReplyError::Closed("worker process exited".into()));

        let stopping = self.inner.stopping.load(Ordering::SeqCst);
        let attempts = self.inner.restart_attempts.load(Ordering::SeqCst);
        let will_restart = !stopping && attempts < self.inner.config.max_restart_attempts;
        let _ = self.inner.events.send(WorkerEvent::Exited {
            exit,
            restarting: will_restart,
        });

        if stopping {
            info!(code = ?exit.code, "plugin worker stopped");
            return;
        }

        warn!(code = ?exit.code, attempts, "plugin worker exited unexpectedly");
        if !will_restart {
            error!(attempts, "plugin worker retry budget exhausted; staying down");
            return;
        }

        self.inner.restart_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.inner.config.restart_delay).await;
        if self.inner.stopping.load(Ordering::SeqCst) {
            return;
        }
        match self.spawn_worker().await {
            Ok(()) => info!(attempt = attempts + 1, "plugin worker relaunched"),
            Err(e) => error!(error = %e, "failed to relaunch plugin worker"),
        }
    }
}

/// Waits for exit, honoring a concurrent kill request.
async fn wait_with_kill(
    mut handle: Box<dyn WorkerHandle>,
    mut kill_rx: oneshot::Receiver<()>,
) -> WorkerExit {
    tokio::select! {
        exit = handle.wait() => return exit,
        _ = &mut kill_rx => {}
    }
    handle.start_kill();
    handle.wait().await
}

/// Waits for an `Exited` event within the deadline.
async fn wait_for_exit(events: &mut broadcast::Receiver<WorkerEvent>, within: Duration) -> bool {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Exited { .. }) => return true,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

fn handle_worker_line(inner: &Arc<ManagerInner>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let message: WorkerMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "discarding malformed worker message");
            return;
        }
    };

    match message {
        WorkerMessage::Ready { version } => {
            if version != PROTOCOL_VERSION {
                warn!(
                    version,
                    expected = PROTOCOL_VERSION,
                    "worker protocol version mismatch"
                );
            }
            let _ = inner.ready.send(true);
            let _ = inner.events.send(WorkerEvent::Ready);
            info!("plugin worker ready");
        }
        WorkerMessage::Result { id, data } => {
            if !inner.tracker.complete(id, data) {
                debug!(id, "reply for unknown request id");
            }
        }
        WorkerMessage::Error { id, error } => {
            if !inner.tracker.fail(id, ReplyError::Rejected(error)) {
                debug!(id, "error for unknown request id");
            }
        }
        WorkerMessage::Pong { id } => {
            if !inner.tracker.complete(id, None) {
                debug!(id, "pong for unknown request id");
            }
        }
        WorkerMessage::Log {
            plugin_id,
            level,
            message,
        } => {
            let plugin_id = plugin_id.unwrap_or_else(|| "worker".to_string());
            match level {
                LogLevel::Debug => debug!(plugin_id = %plugin_id, "{message}"),
                LogLevel::Info => info!(plugin_id = %plugin_id, "{message}"),
                LogLevel::Warn => warn!(plugin_id = %plugin_id, "{message}"),
                LogLevel::Error => error!(plugin_id = %plugin_id, "{message}"),
            }
        }
    }
}

fn reply_error_to_host(error: ReplyError) -> PluginHostError {
    match error {
        ReplyError::Timeout { timeout_ms } => PluginHostError::Timeout { timeout_ms },
        ReplyError::Rejected(message) => PluginHostError::WorkerRejected(message),
        ReplyError::Closed(_) => PluginHostError::WorkerExited,
    }
}

/// Scripted worker doubles for testing the manager.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    /// How a scripted worker behaves after launch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WorkerBehavior {
        /// Handshake, then answer every request.
        Responsive,
        /// Handshake, then swallow every request without replying.
        Unresponsive,
        /// Exit immediately with the given code; no handshake.
        CrashImmediately(i32),
    }

    /// Launches in-memory scripted workers over duplex pipes.
    pub struct ScriptedLauncher {
        plan: std::sync::Mutex<VecDeque<WorkerBehavior>>,
        fallback: WorkerBehavior,
        launches: AtomicUsize,
        crash_current: std::sync::Mutex<Option<oneshot::Sender<i32>>>,
    }

    impl ScriptedLauncher {
        /// Every launch behaves as `fallback` unless a plan is queued.
        pub fn new(fallback: WorkerBehavior) -> Arc<Self> {
            Arc::new(Self {
                plan: std::sync::Mutex::new(VecDeque::new()),
                fallback,
                launches: AtomicUsize::new(0),
                crash_current: std::sync::Mutex::new(None),
            })
        }

        /// Queues a behavior for the next launch.
        pub fn push_behavior(&self, behavior: WorkerBehavior) {
            if let Ok(mut plan) = self.plan.lock() {
                plan.push_back(behavior);
            }
        }

        /// Number of times `launch` has been called.
        pub fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        /// Makes the currently live worker exit with `code`.
        /// Returns false if no worker is live.
        pub fn crash_current(&self, code: i32) -> bool {
            let sender = self.crash_current.lock().ok().and_then(|mut s| s.take());
            match sender {
                Some(tx) => tx.send(code).is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for ScriptedLauncher {
        async fn launch(&self) -> HostResult<WorkerProcess> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .plan
                .lock()
                .ok()
                .and_then(|mut plan| plan.pop_front())
                .unwrap_or(self.fallback);

            let (host_stdin, worker_stdin) = tokio::io::duplex(64 * 1024);
            let (worker_stdout, host_stdout) = tokio::io::duplex(64 * 1024);
            let (exit_tx, exit_rx) = watch::channel(None);
            let (kill_tx, kill_rx) = oneshot::channel();
            let (crash_tx, crash_rx) = oneshot::channel();
            if let Ok(mut slot) = self.crash_current.lock() {
                *slot = Some(crash_tx);
            }

            tokio::spawn(run_worker(
                behavior,
                worker_stdin,
                worker_stdout,
                exit_tx,
                kill_rx,
                crash_rx,
            ));

            Ok(WorkerProcess {
                stdin: Box::new(host_stdin),
                stdout: Box::new(host_stdout),
                handle: Box::new(ScriptedHandle {
                    exit: exit_rx,
                    kill: Some(kill_tx),
                }),
            })
        }
    }

    struct ScriptedHandle {
        exit: watch::Receiver<Option<WorkerExit>>,
        kill: Option<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl WorkerHandle for ScriptedHandle {
        async fn wait(&mut self) -> WorkerExit {
            match self.exit.wait_for(Option::is_some).await {
                Ok(exit) => (*exit).unwrap_or(WorkerExit { code: None }),
                Err(_) => WorkerExit { code: None },
            }
        }

        fn start_kill(&mut self) {
            if let Some(kill) = self.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    async fn run_worker(
        behavior: WorkerBehavior,
        stdin: DuplexStream,
        mut stdout: DuplexStream,
        exit_tx: watch::Sender<Option<WorkerExit>>,
        mut kill_rx: oneshot::Receiver<()>,
        mut crash_rx: oneshot::Receiver<i32>,
    ) {
        if let WorkerBehavior::CrashImmediately(code) = behavior {
            let _ = exit_tx.send(Some(WorkerExit { code: Some(code) }));
            return;
        }

        let ready = serde_json::to_string(&WorkerMessage::Ready {
            version: PROTOCOL_VERSION,
        })
        .expect("serialize ready")
            + "\n";
        let _ = stdout.write_all(ready.as_bytes()).await;

        let mut lines = BufReader::new(stdin).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else {
                        // Host closed our stdin: orderly exit.
                        let _ = exit_tx.send(Some(WorkerExit { code: Some(0) }));
                        return;
                    };
                    if behavior == WorkerBehavior::Unresponsive {
                        continue;
                    }
                    let Ok(message) = serde_json::from_str::<HostMessage>(&line) else {
                        continue;
                    };
                    let reply = match message {
                        HostMessage::Ping { id } => WorkerMessage::Pong { id },
                        HostMessage::Call { id, data, .. } => WorkerMessage::Result {
                            id,
                            data: Some(data.args),
                        },
                        HostMessage::Activate { id, .. } | HostMessage::Deactivate { id, .. } => {
                            WorkerMessage::Result { id, data: None }
                        }
                        HostMessage::Shutdown { .. } => {
                            let _ = exit_tx.send(Some(WorkerExit { code: Some(0) }));
                            return;
                        }
                    };
                    let json = serde_json::to_string(&reply).expect("serialize reply") + "\n";
                    let _ = stdout.write_all(json.as_bytes()).await;
                }
                _ = &mut kill_rx => {
                    // Killed by signal: no exit code.
                    let _ = exit_tx.send(Some(WorkerExit { code: None }));
                    return;
                }
                code = &mut crash_rx => {
                    let code = code.unwrap_or(1);
                    let _ = exit_tx.send(Some(WorkerExit { code: Some(code) }));
                    return;
                }
            }
        }
    }
}
