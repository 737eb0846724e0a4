use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nodectl_protocol::LogLine;
use nodectl_protocol::NodeConfig;
use nodectl_protocol::RunState;
use nodectl_protocol::SupervisorEvent;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::logs::LogHandle;
use crate::release::ReleaseClient;
use crate::release::worker_binary_path;
use crate::runner::ProcessRunner;

/// Cadence of the liveness poll that reconciles unnoticed worker death.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The orchestrating state machine. Owns the authoritative [`RunState`],
/// serializes start/stop/update intents, and publishes progress and status
/// events to subscribers.
///
/// Construct inside a tokio runtime; a background task polls worker
/// liveness for as long as the supervisor is alive.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// `RunState` as its `u8` repr so status queries never block.
    state: AtomicU8,
    /// Serializes top-level intents; at most one transition is in flight.
    intent: Mutex<()>,
    runner: ProcessRunner,
    logs: LogHandle,
    releases: ReleaseClient,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Inner {
    fn state(&self) -> RunState {
        RunState::from_repr(self.state.load(Ordering::SeqCst)).unwrap_or(RunState::Stopped)
    }

    fn set_state(&self, next: RunState) {
        let prev = self.state.swap(next as u8, Ordering::SeqCst);
        if prev != next as u8 {
            info!(state = %next, "run state changed");
            let _ = self.events.send(SupervisorEvent::StatusChanged { state: next });
        }
    }
}

impl Supervisor {
    pub fn new(releases: ReleaseClient) -> Self {
        Self::with_reconcile_interval(releases, RECONCILE_INTERVAL)
    }

    /// Like [`Supervisor::new`] with an explicit liveness poll cadence.
    pub fn with_reconcile_interval(releases: ReleaseClient, reconcile_interval: Duration) -> Self {
        let logs = LogHandle::new();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            state: AtomicU8::new(RunState::Stopped as u8),
            intent: Mutex::new(()),
            runner: ProcessRunner::new(logs.clone()),
            logs,
            releases,
            events,
        });
        spawn_reconciler(&inner, reconcile_interval);
        Self { inner }
    }

    /// Validates `config` and launches the worker.
    /// `Stopped → Starting → Running`, or back to `Stopped` on spawn
    /// failure.
    pub async fn start(&self, config: NodeConfig) -> Result<()> {
        validate_config(&config)?;
        let _intent = self.inner.intent.lock().await;
        let state = self.inner.state();
        if state != RunState::Stopped {
            return Err(SupervisorError::AlreadyRunning { state });
        }
        self.inner.set_state(RunState::Starting);
        self.inner.logs.append(format!(
            "starting node (db {}, api port {}, p2p port {})",
            config.db_path, config.api_port, config.p2p_port
        ));
        match self.inner.runner.spawn(&config) {
            Ok(()) => {
                self.inner.logs.append("node started");
                self.inner.set_state(RunState::Running);
                Ok(())
            }
            Err(err) => {
                self.inner.logs.append(format!("start failed: {err}"));
                self.inner.set_state(RunState::Stopped);
                Err(err)
            }
        }
    }

    /// Graceful stop, escalating to a forced kill after the grace period.
    /// `Running → Stopping → Stopped`; the run always resolves to `Stopped`,
    /// even when termination reports an error.
    pub async fn stop(&self) -> Result<()> {
        let _intent = self.inner.intent.lock().await;
        let state = self.inner.state();
        if state != RunState::Running {
            return Err(SupervisorError::NotRunning { state });
        }
        self.inner.set_state(RunState::Stopping);
        let result = self.inner.runner.terminate().await;
        match &result {
            Ok(()) => self.inner.logs.append("node stopped"),
            Err(err) => {
                warn!(%err, "termination reported an error");
                self.inner.logs.append(format!("stop finished with an error: {err}"));
            }
        }
        self.inner.set_state(RunState::Stopped);
        result
    }

    /// Admits an update and returns immediately; the transfer runs as a
    /// background task that reports [`SupervisorEvent::DownloadProgress`]
    /// followed by exactly one terminal event. `Stopped → Updating →
    /// Stopped` on every outcome.
    pub async fn check_for_update(&self, db_path: &str) -> Result<()> {
        let _intent = self.inner.intent.lock().await;
        let state = self.inner.state();
        if state != RunState::Stopped {
            return Err(SupervisorError::Busy { state });
        }
        self.inner.set_state(RunState::Updating);
        let inner = self.inner.clone();
        let db_path = db_path.to_string();
        tokio::spawn(async move {
            match run_update(&inner, &db_path).await {
                Ok(version) => {
                    inner.logs.append(format!("update complete: {version}"));
                    let _ = inner.events.send(SupervisorEvent::DownloadComplete);
                }
                Err(err) => {
                    inner.logs.append(format!("update failed: {err}"));
                    let _ = inner.events.send(SupervisorEvent::DownloadFailed {
                        reason: err.to_string(),
                    });
                }
            }
            inner.set_state(RunState::Stopped);
        });
        Ok(())
    }

    /// Non-blocking read of the authoritative state.
    pub fn query_status(&self) -> RunState {
        self.inner.state()
    }

    pub fn query_logs(&self) -> Vec<LogLine> {
        self.inner.logs.snapshot()
    }

    /// Log lines appended after `cursor`, plus the next cursor. Usable as a
    /// tail even after the ring starts evicting.
    pub fn logs_since(&self, cursor: u64) -> (Vec<LogLine>, u64) {
        self.inner.logs.lines_since(cursor)
    }

    pub fn logs_text(&self) -> String {
        self.inner.logs.render_text()
    }

    /// Discards all log entries, in any run state.
    pub fn clear_logs(&self) {
        self.inner.logs.clear();
    }

    /// New subscription to supervisor events. Dropping the receiver never
    /// affects in-flight operations.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }
}

async fn run_update(inner: &Arc<Inner>, db_path: &str) -> Result<String> {
    inner.logs.append("checking for updates");
    let release = inner.releases.latest().await?;
    inner
        .logs
        .append(format!("found release {} ({} bytes)", release.version, release.size));
    let dest = worker_binary_path(db_path);
    let events = inner.events.clone();
    inner
        .releases
        .download(&release.url, &dest, release.size, move |progress| {
            let _ = events.send(SupervisorEvent::DownloadProgress(progress));
        })
        .await?;
    Ok(release.version)
}

fn spawn_reconciler(inner: &Arc<Inner>, interval: Duration) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.state() != RunState::Running {
                continue;
            }
            // Reconciliation must not race an in-flight intent: probe only
            // when no transition holds the lock, and re-check the state
            // afterwards rather than trusting a raw handle.
            let Ok(_intent) = inner.intent.try_lock() else {
                continue;
            };
            if inner.state() == RunState::Running && !inner.runner.is_alive() {
                inner.logs.append("node exited unexpectedly");
                inner.set_state(RunState::Stopped);
            }
        }
    });
}

fn validate_config(config: &NodeConfig) -> Result<()> {
    if config.db_path.trim().is_empty() {
        return Err(SupervisorError::InvalidConfig {
            reason: "dbPath must not be empty".to_string(),
        });
    }
    if config.api_port == 0 {
        return Err(SupervisorError::InvalidConfig {
            reason: "apiPort must be between 1 and 65535".to_string(),
        });
    }
    if config.p2p_port == 0 {
        return Err(SupervisorError::InvalidConfig {
            reason: "p2pPort must be between 1 and 65535".to_string(),
        });
    }
    Ok(())
}
