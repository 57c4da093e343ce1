//! Bridge facade: lifecycle, request dispatch, event routing.
//!
//! Flow:
//! 1. Spawn the worker subprocess
//! 2. Perform the handshake, enter Running
//! 3. One read task routes stdout records to the tracker and event bus
//! 4. On worker crash: reject every pending request, then notify
//!
//! Exactly one task reads the worker's stdout. Settling is serialized
//! through the tracker's table removal, so the read task, timer tasks, and
//! cancellation never double-resolve an id.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::api::HandshakeInfo;
use crate::bridge::codec::{JsonLineCodec, LineFramer};
use crate::bridge::protocol::{
    Incoming, PROTOCOL_VERSION, Request, RequestId, decode_record,
};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, StartError};
use crate::events::{EventBus, EventName, Subscription};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::supervisor::{ExitNotice, ProcessSupervisor};
use crate::tracker::RequestTracker;

type SharedWriter = Arc<tokio::sync::Mutex<FramedWrite<ChildStdin, JsonLineCodec<Request>>>>;

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The worker exited unexpectedly; `start()` is required to recover.
    Crashed,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the bridge lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub pid: Option<u32>,
    /// RFC 3339 timestamp of the last successful `start()`.
    pub started_at: Option<String>,
}

struct RuntimeInfo {
    pid: Option<u32>,
    started_at: String,
    handshake: HandshakeInfo,
}

struct Connection {
    writer: SharedWriter,
    supervisor: ProcessSupervisor,
    read_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    exit_task: JoinHandle<()>,
}

/// Client bridge to one worker process.
///
/// Owns one supervisor, tracker, event bus, and metrics collector for its
/// lifetime; multiple clients are fully independent.
pub struct BridgeClient {
    config: BridgeConfig,
    state: Arc<StdMutex<BridgeState>>,
    tracker: Arc<RequestTracker>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    runtime: StdMutex<Option<RuntimeInfo>>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            config,
            state: Arc::new(StdMutex::new(BridgeState::Stopped)),
            tracker: Arc::new(RequestTracker::new(Arc::clone(&metrics))),
            events: Arc::new(EventBus::new()),
            metrics,
            conn: tokio::sync::Mutex::new(None),
            runtime: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> BridgeState {
        *lock(&self.state)
    }

    pub fn status(&self) -> BridgeStatus {
        let runtime = lock(&self.runtime);
        BridgeStatus {
            state: self.state(),
            pid: runtime.as_ref().and_then(|r| r.pid),
            started_at: runtime.as_ref().map(|r| r.started_at.clone()),
        }
    }

    /// Handshake payload from the last successful `start()`.
    pub fn handshake_info(&self) -> Option<HandshakeInfo> {
        lock(&self.runtime).as_ref().map(|r| r.handshake.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn subscribe<F>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events.subscribe(name, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.events.unsubscribe(subscription)
    }

    /// Spawn the worker and wait for its handshake.
    ///
    /// Valid from Stopped or Crashed. On any failure the worker is torn
    /// down and the bridge returns to Stopped.
    pub async fn start(&self) -> Result<HandshakeInfo, StartError> {
        let mut conn_slot = self.conn.lock().await;

        {
            let mut state = lock(&self.state);
            match *state {
                BridgeState::Stopped | BridgeState::Crashed => *state = BridgeState::Starting,
                other => return Err(StartError::InvalidState(other)),
            }
        }

        // Leftovers from a crashed connection: the tasks are already dead,
        // this just drops the handles.
        if let Some(old) = conn_slot.take() {
            old.read_task.abort();
            old.stderr_task.abort();
            old.exit_task.abort();
        }
        *lock(&self.runtime) = None;

        let spawned =
            ProcessSupervisor::start(self.config.spawner.as_ref(), &self.config.command);
        let (supervisor, stdin, stdout, stderr) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                *lock(&self.state) = BridgeState::Stopped;
                return Err(StartError::Spawn(e));
            }
        };

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            stdin,
            JsonLineCodec::new(),
        )));

        let read_task = tokio::spawn(read_loop(
            stdout,
            Arc::clone(&self.tracker),
            Arc::clone(&self.events),
            self.config.max_record_bytes,
        ));
        let stderr_task = tokio::spawn(forward_stderr(stderr));
        let exit_task = tokio::spawn(watch_exit(
            supervisor.subscribe_exit(),
            Arc::clone(&self.state),
            Arc::clone(&self.tracker),
            Arc::clone(&self.events),
        ));

        let handshake_params = json!({ "protocolVersion": PROTOCOL_VERSION });
        let handshake = Self::issue(
            &writer,
            &self.tracker,
            RequestId::generate(),
            "handshake",
            Some(handshake_params),
            self.config.startup_timeout,
        )
        .await
        .and_then(|value| {
            serde_json::from_value::<HandshakeInfo>(value)
                .map_err(|e| BridgeError::Payload(e.to_string()))
        });

        let info = match handshake {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "worker failed to become ready");
                // Teardown is deliberate from here on; the exit watcher
                // must not treat it as a crash.
                {
                    let mut state = lock(&self.state);
                    if *state == BridgeState::Starting {
                        *state = BridgeState::Stopping;
                    }
                }
                supervisor.shutdown(self.config.shutdown_grace).await;
                // The exit watcher still owes its terminal notification.
                let _ = tokio::time::timeout(Duration::from_secs(1), exit_task).await;
                read_task.abort();
                stderr_task.abort();
                *lock(&self.state) = BridgeState::Stopped;
                return Err(match e {
                    BridgeError::Timeout(after) => StartError::StartupTimeout(after),
                    other => StartError::Handshake(other),
                });
            }
        };

        {
            let mut state = lock(&self.state);
            if *state != BridgeState::Starting {
                // Worker died between the handshake response and now.
                drop(state);
                supervisor.shutdown(self.config.shutdown_grace).await;
                *lock(&self.state) = BridgeState::Stopped;
                return Err(StartError::Handshake(BridgeError::ProcessCrash {
                    detail: "worker exited during startup".to_string(),
                }));
            }
            *state = BridgeState::Running;
        }

        *lock(&self.runtime) = Some(RuntimeInfo {
            pid: supervisor.pid(),
            started_at: chrono::Utc::now().to_rfc3339(),
            handshake: info.clone(),
        });
        *conn_slot = Some(Connection {
            writer,
            supervisor,
            read_task,
            stderr_task,
            exit_task,
        });

        tracing::info!(protocol = %info.protocol_version, "bridge running");
        Ok(info)
    }

    /// Stop the worker: reject pending requests, ask it to shut down,
    /// then escalate SIGTERM to SIGKILL after the grace period.
    ///
    /// A no-op unless the bridge is Running.
    pub async fn stop(&self) {
        let mut conn_slot = self.conn.lock().await;

        {
            let mut state = lock(&self.state);
            if *state != BridgeState::Running {
                return;
            }
            *state = BridgeState::Stopping;
        }

        let Some(conn) = conn_slot.take() else {
            *lock(&self.state) = BridgeState::Stopped;
            return;
        };

        let rejected = self.tracker.fail_all(&BridgeError::Cancelled);
        if rejected > 0 {
            tracing::debug!(rejected, "rejected requests pending at shutdown");
        }

        // Fire-and-forget: a cooperative worker acknowledges and exits
        // before the signals land. Its response, if any, arrives for an
        // id nobody tracks and is dropped.
        {
            let mut writer = conn.writer.lock().await;
            let _ = writer
                .send(Request::new("shutdown", None, RequestId::generate()))
                .await;
        }

        let notice = conn.supervisor.shutdown(self.config.shutdown_grace).await;
        tracing::info!(detail = %notice.describe(), "worker stopped");

        // Let the exit watcher publish its terminal notification before
        // the handles go away.
        let _ = tokio::time::timeout(Duration::from_secs(1), conn.exit_task).await;
        conn.read_task.abort();
        conn.stderr_task.abort();

        *lock(&self.runtime) = None;
        *lock(&self.state) = BridgeState::Stopped;
    }

    /// Send a request with a generated id and the configured default
    /// timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, BridgeError> {
        self.request_with(RequestId::generate(), method, params, self.config.request_timeout)
            .await
    }

    /// Send a request with an explicit id and timeout.
    ///
    /// The returned future settles when a matching response is decoded,
    /// the timeout elapses, the request is cancelled, or the worker
    /// terminates; never earlier, never twice.
    pub async fn request_with(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        {
            let state = lock(&self.state);
            if *state != BridgeState::Running {
                return Err(BridgeError::NotRunning(*state));
            }
        }

        let writer = {
            let conn = self.conn.lock().await;
            match conn.as_ref() {
                Some(conn) => Arc::clone(&conn.writer),
                None => return Err(BridgeError::NotRunning(self.state())),
            }
        };

        Self::issue(&writer, &self.tracker, id, method, params, timeout).await
    }

    /// Cancel a pending request. Behaves exactly like a timeout, without
    /// waiting for one: the entry is removed and the caller's future
    /// settles with [`BridgeError::Cancelled`].
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.tracker.settle(id, Err(BridgeError::Cancelled))
    }

    async fn issue(
        writer: &SharedWriter,
        tracker: &Arc<RequestTracker>,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let rx = tracker.register(id.clone(), timeout)?;

        let request = Request::new(method, params, id.clone());
        tracing::debug!(%id, method, "sending request");
        let sent = {
            let mut writer = writer.lock().await;
            writer.send(request).await
        };
        if let Err(e) = sent {
            tracker.settle(&id, Err(BridgeError::Write(e.to_string())));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Abandoned),
        }
    }
}

/// The single reader of the worker's stdout.
///
/// Malformed records are logged and dropped; they never disturb the
/// correlation of surrounding records.
async fn read_loop(
    stdout: ChildStdout,
    tracker: Arc<RequestTracker>,
    events: Arc<EventBus>,
    max_record_bytes: usize,
) {
    let framer = LineFramer::with_max_record_bytes(max_record_bytes);
    let mut frames = FramedRead::new(stdout, framer);

    while let Some(item) = frames.next().await {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "worker stdout read error");
                break;
            }
        };

        match decode_record(&record) {
            Ok(Incoming::Response { id, outcome }) => {
                let outcome = outcome.map_err(|body| BridgeError::Remote {
                    code: body.code,
                    message: body.message,
                    data: body.data,
                });
                if !tracker.settle(&id, outcome) {
                    // Unregistered or already timed out; dropping is the
                    // whole point of idempotent removal.
                    tracing::debug!(%id, "response for unknown or settled request");
                }
            }
            Ok(Incoming::Event(event)) => {
                let name = EventName::parse(&event.name);
                let delivered = events.publish(&name, &event.data);
                tracing::trace!(%name, delivered, "event dispatched");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    record = %String::from_utf8_lossy(&record[..record.len().min(256)]),
                    "discarding undecodable record"
                );
            }
        }
    }

    tracing::debug!("worker stdout closed");
}

/// Stream worker stderr into structured logging. Stderr is diagnostics
/// only and is never parsed as protocol data.
async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "evobridge::worker", "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "worker stderr read error");
                break;
            }
        }
    }
}

/// Terminal lifecycle handling, one task per worker.
///
/// On unexpected exit the pending requests are rejected first, then the
/// exited notification goes out, so no observer can see the notification
/// while callers still hang.
async fn watch_exit(
    mut exit_rx: tokio::sync::watch::Receiver<Option<ExitNotice>>,
    state: Arc<StdMutex<BridgeState>>,
    tracker: Arc<RequestTracker>,
    events: Arc<EventBus>,
) {
    let notice = loop {
        if let Some(notice) = exit_rx.borrow_and_update().clone() {
            break notice;
        }
        if exit_rx.changed().await.is_err() {
            break ExitNotice {
                code: None,
                signal: None,
            };
        }
    };

    let unexpected = {
        let mut state = lock(&state);
        match *state {
            BridgeState::Running | BridgeState::Starting => {
                *state = BridgeState::Crashed;
                true
            }
            _ => false,
        }
    };

    if unexpected {
        let rejected = tracker.fail_all(&BridgeError::ProcessCrash {
            detail: notice.describe(),
        });
        tracing::error!(
            detail = %notice.describe(),
            rejected,
            "worker crashed"
        );
    }

    events.publish(
        &EventName::WorkerExited,
        &json!({
            "code": notice.code,
            "signal": notice.signal,
            "expected": !unexpected,
        }),
    );
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
