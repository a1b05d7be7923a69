//! Backend Lifecycle Manager
//!
//! Drives backends through an explicit state machine and publishes every
//! transition on a broadcast channel. Commands validate the current state
//! first; an illegal command fails without touching the backend, while a
//! command whose target state already holds is a successful no-op.
//!
//! # States
//!
//! ```text
//! Stopped -> Starting -> Running -> Pausing -> Paused
//!    ^          |           |                    |
//!    |          v           v                    v
//!    +------ Error <--- (failures)            Running (resume)
//! ```
//!
//! Any state can land in `Error` via [`LifecycleManager::report_error`];
//! `start` recovers from it, optionally automatically.

use crate::adapter::BackendAdapter;
use crate::backend::AdapterRegistry;
use crate::events::{LifecycleEvent, EVENT_CHANNEL_CAPACITY};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchboard_common::auth::AuthAdapter;
use switchboard_common::protocol::{Result, SwitchboardError};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Retained transition events per backend before the oldest are evicted.
const LIFECYCLE_HISTORY_CAP: usize = 200;

/// Where a backend is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Pausing => "pausing",
            LifecycleState::Paused => "paused",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Graceful disconnect budget; the stop proceeds once it expires
    pub shutdown_timeout: Duration,
    /// Delay before each automatic restart attempt
    pub restart_delay: Duration,
    /// Automatic restarts allowed before giving up on a backend
    pub max_restart_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            max_restart_attempts: 3,
        }
    }
}

struct TrackedBackend {
    state: LifecycleState,
    auto_restart: bool,
    restart_attempts: u32,
}

struct LifecycleInner {
    config: LifecycleConfig,
    registry: AdapterRegistry,
    auth: Option<Arc<dyn AuthAdapter>>,
    backends: RwLock<HashMap<String, TrackedBackend>>,
    history: RwLock<HashMap<String, Vec<LifecycleEvent>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

/// Drives backend state transitions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleInner>,
}

impl LifecycleManager {
    /// Creates a manager over the shared adapter registry.
    ///
    /// # Arguments
    ///
    /// * `registry` - Shared backend adapter registry
    /// * `auth` - Optional authentication adapter consulted during startup
    pub fn new(
        config: LifecycleConfig,
        registry: AdapterRegistry,
        auth: Option<Arc<dyn AuthAdapter>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(LifecycleInner {
                config,
                registry,
                auth,
                backends: RwLock::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Begins tracking a backend in the `Stopped` state.
    pub async fn track(&self, backend_id: impl Into<String>, auto_restart: bool) {
        self.inner.backends.write().await.insert(
            backend_id.into(),
            TrackedBackend {
                state: LifecycleState::Stopped,
                auto_restart,
                restart_attempts: 0,
            },
        );
    }

    /// Stops tracking a backend.
    pub async fn untrack(&self, backend_id: &str) {
        self.inner.backends.write().await.remove(backend_id);
    }

    /// Current state of one backend.
    pub async fn state(&self, backend_id: &str) -> Option<LifecycleState> {
        self.inner
            .backends
            .read()
            .await
            .get(backend_id)
            .map(|b| b.state)
    }

    /// Current state of every tracked backend.
    pub async fn states(&self) -> HashMap<String, LifecycleState> {
        self.inner
            .backends
            .read()
            .await
            .iter()
            .map(|(id, b)| (id.clone(), b.state))
            .collect()
    }

    /// Subscribes to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Recent transition events across all backends, oldest first.
    ///
    /// History is retained per backend, so one flapping backend cannot
    /// evict another backend's audit trail.
    pub async fn history(&self) -> Vec<LifecycleEvent> {
        let history = self.inner.history.read().await;
        let mut all: Vec<LifecycleEvent> = history.values().flatten().cloned().collect();
        all.sort_by_key(|e| e.timestamp_ms);
        all
    }

    /// Recent transition events for one backend, oldest first.
    pub async fn history_for(&self, backend_id: &str) -> Vec<LifecycleEvent> {
        self.inner
            .history
            .read()
            .await
            .get(backend_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Toggles automatic restart for a backend.
    pub async fn set_auto_restart(&self, backend_id: &str, enabled: bool) -> bool {
        match self.inner.backends.write().await.get_mut(backend_id) {
            Some(backend) => {
                backend.auto_restart = enabled;
                if enabled {
                    backend.restart_attempts = 0;
                }
                true
            }
            None => false,
        }
    }

    /// Starts a backend: authenticate, connect, verify capabilities,
    /// probe availability, then mark `Running`.
    ///
    /// Legal from `Stopped` and `Error`; a no-op when already `Running`.
    /// Any startup step failing lands the backend in `Error`.
    pub async fn start(&self, backend_id: &str) -> Result<()> {
        match self.current(backend_id).await? {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Stopped | LifecycleState::Error => {}
            other => return Err(invalid("start", other)),
        }
        let adapter = self.adapter(backend_id).await?;
        self.set_state(backend_id, "start", LifecycleState::Starting, None)
            .await;

        match self.run_startup(backend_id, adapter.as_ref()).await {
            Ok(()) => {
                if let Some(backend) = self.inner.backends.write().await.get_mut(backend_id) {
                    backend.restart_attempts = 0;
                }
                self.set_state(backend_id, "start", LifecycleState::Running, None)
                    .await;
                info!(backend_id, "backend started");
                Ok(())
            }
            Err(e) => {
                self.set_state(backend_id, "start", LifecycleState::Error, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_startup(&self, backend_id: &str, adapter: &dyn BackendAdapter) -> Result<()> {
        if adapter.capabilities().auth {
            if let Some(auth) = &self.inner.auth {
                let outcome = auth.authenticate(backend_id, &adapter.status()).await;
                if !outcome.is_authenticated {
                    return Err(SwitchboardError::Auth(
                        outcome
                            .error
                            .unwrap_or_else(|| "authentication rejected".to_string()),
                    ));
                }
            }
        }

        adapter.connect().await?;

        if !adapter.capabilities().any() {
            return Err(SwitchboardError::Execution(
                "backend exposes no capabilities".to_string(),
            ));
        }

        if !adapter.is_available().await {
            return Err(SwitchboardError::BackendUnavailable(backend_id.to_string()));
        }
        Ok(())
    }

    /// Stops a backend, disconnecting within the shutdown timeout.
    ///
    /// Legal from `Running`, `Paused` and `Error`; a no-op when already
    /// `Stopped`. A disconnect that hangs past the timeout is abandoned
    /// and the backend is still marked `Stopped`.
    pub async fn stop(&self, backend_id: &str) -> Result<()> {
        match self.current(backend_id).await? {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Running | LifecycleState::Paused | LifecycleState::Error => {}
            other => return Err(invalid("stop", other)),
        }
        let adapter = self.adapter(backend_id).await?;
        self.set_state(backend_id, "stop", LifecycleState::Stopping, None)
            .await;

        match tokio::time::timeout(self.inner.config.shutdown_timeout, adapter.disconnect()).await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(backend_id, error = %e, "disconnect failed during shutdown"),
            Err(_) => warn!(backend_id, "disconnect timed out, forcing stop"),
        }

        self.set_state(backend_id, "stop", LifecycleState::Stopped, None)
            .await;
        info!(backend_id, "backend stopped");
        Ok(())
    }

    /// Pauses a running backend. Legal from `Running`; a no-op when
    /// already `Paused`. The connection stays up.
    pub async fn pause(&self, backend_id: &str) -> Result<()> {
        match self.current(backend_id).await? {
            LifecycleState::Paused => return Ok(()),
            LifecycleState::Running => {}
            other => return Err(invalid("pause", other)),
        }
        self.set_state(backend_id, "pause", LifecycleState::Pausing, None)
            .await;
        self.set_state(backend_id, "pause", LifecycleState::Paused, None)
            .await;
        Ok(())
    }

    /// Resumes a paused backend. Legal from `Paused`; a no-op when
    /// already `Running`. Passes through `Starting` but skips the full
    /// startup sequence since the connection never went down.
    pub async fn resume(&self, backend_id: &str) -> Result<()> {
        match self.current(backend_id).await? {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Paused => {}
            other => return Err(invalid("resume", other)),
        }
        self.set_state(backend_id, "resume", LifecycleState::Starting, None)
            .await;
        self.set_state(backend_id, "resume", LifecycleState::Running, None)
            .await;
        Ok(())
    }

    /// Full stop-then-start cycle, waiting the configured restart delay
    /// between the two so the backend can settle after disconnecting.
    pub async fn restart(&self, backend_id: &str) -> Result<()> {
        self.stop(backend_id).await?;
        tokio::time::sleep(self.inner.config.restart_delay).await;
        self.start(backend_id).await
    }

    /// Records a runtime failure, landing the backend in `Error`.
    ///
    /// When automatic restart is enabled and the attempt budget is not
    /// exhausted, a background task retries `start` after the configured
    /// delay, giving up (and disabling auto-restart) once the budget runs
    /// out.
    pub async fn report_error(&self, backend_id: &str, error: impl Into<String>) {
        let message = error.into();
        self.set_state(backend_id, "error", LifecycleState::Error, Some(message.clone()))
            .await;
        warn!(backend_id, error = %message, "backend entered error state");

        if self.consume_restart_attempt(backend_id).await {
            let mgr = self.clone();
            let id = backend_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(mgr.inner.config.restart_delay).await;
                    match mgr.start(&id).await {
                        Ok(()) => {
                            info!(backend_id = %id, "automatic restart succeeded");
                            break;
                        }
                        Err(e) => {
                            warn!(backend_id = %id, error = %e, "automatic restart failed");
                            if !mgr.consume_restart_attempt(&id).await {
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Takes one restart attempt from the budget.
    ///
    /// Disables auto-restart and returns `false` when the budget is
    /// exhausted (or the backend is untracked / has auto-restart off).
    async fn consume_restart_attempt(&self, backend_id: &str) -> bool {
        let mut backends = self.inner.backends.write().await;
        let Some(backend) = backends.get_mut(backend_id) else {
            return false;
        };
        if !backend.auto_restart {
            return false;
        }
        if backend.restart_attempts >= self.inner.config.max_restart_attempts {
            backend.auto_restart = false;
            warn!(backend_id, "restart budget exhausted, auto-restart disabled");
            return false;
        }
        backend.restart_attempts += 1;
        true
    }

    async fn current(&self, backend_id: &str) -> Result<LifecycleState> {
        self.state(backend_id)
            .await
            .ok_or_else(|| SwitchboardError::BackendNotFound(backend_id.to_string()))
    }

    async fn adapter(&self, backend_id: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.inner
            .registry
            .read()
            .await
            .get(backend_id)
            .cloned()
            .ok_or_else(|| SwitchboardError::BackendNotFound(backend_id.to_string()))
    }

    async fn set_state(
        &self,
        backend_id: &str,
        command: &str,
        to: LifecycleState,
        error: Option<String>,
    ) {
        let from = {
            let mut backends = self.inner.backends.write().await;
            match backends.get_mut(backend_id) {
                Some(backend) => {
                    let from = backend.state;
                    backend.state = to;
                    from
                }
                None => return,
            }
        };
        let event = LifecycleEvent::new(backend_id, command, from, to, error);
        {
            let mut history = self.inner.history.write().await;
            let entries = history.entry(backend_id.to_string()).or_default();
            if entries.len() == LIFECYCLE_HISTORY_CAP {
                entries.remove(0);
            }
            entries.push(event.clone());
        }
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

fn invalid(command: &str, state: LifecycleState) -> SwitchboardError {
    SwitchboardError::InvalidTransition {
        command: command.to_string(),
        state: state.to_string(),
    }
}
