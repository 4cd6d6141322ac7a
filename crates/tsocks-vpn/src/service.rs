//! VPN Service Lifecycle
//!
//! Sequences settings resolution, interface establishment and the engine in
//! response to start/stop requests.
//!
//! ```text
//!           start           plan ok             engine up
//! Stopped ───────▶ Preparing ───────▶ Establishing ───────▶ Running
//!    ▲                 │                   │                  │  │
//!    │                 └──── failure ──────┴───── died ───────┘  │ stop
//!    │                          ▼                                ▼
//!    ├───────────────────── Failed                           Stopping
//!    └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A stop during `Preparing` or `Establishing` cancels the attempt, which
//! then unwinds through `Stopping`.
//!
//! The lifecycle mutex is the only serialization point and is never held
//! across blocking work. Settings are re-read at every start.
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = VpnService::new(ServiceConfig::new("com.example.tsocks"), settings, platform, engine)?;
//! service.start().await?;
//!
//! for event in service.poll_events() {
//!     // forward to the UI
//! }
//!
//! service.stop().await;
//! ```

use crate::config::ConfigError;
use crate::engine::{
    CancelFlag, EngineControl, EngineError, EngineSession, EngineStats, ForwardingEngine, LogEvent, LogSink,
    DEFAULT_START_TIMEOUT, DEFAULT_STATS_TIMEOUT, DEFAULT_STOP_TIMEOUT,
};
use crate::plan::InterfacePlan;
use crate::settings::{SettingsError, SettingsSource};
use crate::tunnel::{self, InterfaceBuilder, InterfaceError};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    /// Resolving settings
    Preparing,
    /// Building the interface and starting the engine
    Establishing,
    Running,
    /// Tearing the session down
    Stopping,
    /// A start or a running session failed; reverts to `Stopped`
    Failed,
}

impl ServiceState {
    /// Check if traffic is being forwarded
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check if a start attempt is in flight
    pub fn is_starting(&self) -> bool {
        matches!(self, ServiceState::Preparing | ServiceState::Establishing)
    }

    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;

        matches!(
            (self, next),
            (Stopped, Preparing)
                | (Preparing, Establishing)
                | (Preparing | Establishing, Failed)
                | (Preparing | Establishing, Stopping)
                | (Establishing, Running)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Failed, Stopped)
        )
    }
}

/// Notifications toward the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Log(LogEvent),
    StateChanged(ServiceState),
    /// A proxy protocol needs a server that is not configured
    ConfigurationNeeded(String),
    VpnError(String),
}

/// The host platform's VPN facilities
pub trait VpnPlatform: Send + Sync + 'static {
    /// Has the user granted tunnel-creation consent?
    fn has_consent(&self) -> bool;

    /// A fresh builder for one interface
    fn builder(&self) -> Box<dyn InterfaceBuilder + Send>;
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Package identifier of the host application, never tunneled
    pub own_package: String,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub stats_timeout: Duration,
    /// Engine health poll interval while running
    pub monitor_interval: Duration,
    /// Engine log events buffered before dropping
    pub log_capacity: usize,
}

impl ServiceConfig {
    pub fn new(own_package: impl Into<String>) -> Self {
        Self {
            own_package: own_package.into(),
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            stats_timeout: DEFAULT_STATS_TIMEOUT,
            monitor_interval: Duration::from_secs(5),
            log_capacity: 256,
        }
    }
}

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("VPN permission not granted")]
    PermissionDenied,

    #[error("VPN busy ({0:?})")]
    Busy(ServiceState),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ServiceError {
    fn task(e: tokio::task::JoinError) -> Self {
        ServiceError::Task(e.to_string())
    }

    /// User-facing notification for a failed start
    fn event(&self) -> ServiceEvent {
        match self {
            ServiceError::Config(ConfigError::ServerRequired) => ServiceEvent::ConfigurationNeeded(self.to_string()),
            _ => ServiceEvent::VpnError(self.to_string()),
        }
    }
}

struct Lifecycle {
    state: ServiceState,
    session: Option<EngineSession>,
    cancel: Option<CancelFlag>,
}

struct Inner {
    config: ServiceConfig,
    settings: Arc<dyn SettingsSource>,
    platform: Arc<dyn VpnPlatform>,
    control: EngineControl,
    lifecycle: Mutex<Lifecycle>,
    events_tx: Sender<ServiceEvent>,
    events_rx: Receiver<ServiceEvent>,
    log_sink: LogSink,
    /// Dropping the sender stops the log pump
    pump_shutdown: Option<Sender<()>>,
    log_pump: Option<thread::JoinHandle<()>>,
}

/// VPN service
///
/// Cheap to clone; clones drive the same lifecycle.
#[derive(Clone)]
pub struct VpnService {
    inner: Arc<Inner>,
}

impl VpnService {
    /// Create a new service in the `Stopped` state
    pub fn new(
        config: ServiceConfig,
        settings: Arc<dyn SettingsSource>,
        platform: Arc<dyn VpnPlatform>,
        engine: Arc<dyn ForwardingEngine>,
    ) -> Result<Self, ServiceError> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (log_sink, log_rx) = LogSink::channel(config.log_capacity);

        let (pump_shutdown, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let pump_tx = events_tx.clone();
        let log_pump = thread::Builder::new()
            .name("tsocks-log-pump".into())
            .spawn(move || {
                loop {
                    crossbeam_channel::select! {
                        recv(log_rx) -> event => {
                            let Ok(event) = event else { break };
                            debug!("{}", event);
                            if pump_tx.send(ServiceEvent::Log(event)).is_err() {
                                break;
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("Log pump exited");
            })
            .map_err(|e| ServiceError::Task(e.to_string()))?;

        let control = EngineControl::new(engine).with_timeouts(
            config.start_timeout,
            config.stop_timeout,
            config.stats_timeout,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                settings,
                platform,
                control,
                lifecycle: Mutex::new(Lifecycle {
                    state: ServiceState::Stopped,
                    session: None,
                    cancel: None,
                }),
                events_tx,
                events_rx,
                log_sink,
                pump_shutdown: Some(pump_shutdown),
                log_pump: Some(log_pump),
            }),
        })
    }

    /// Get current state
    pub async fn state(&self) -> ServiceState {
        self.inner.lifecycle.lock().await.state
    }

    /// Start the VPN.
    ///
    /// Rejected with [`ServiceError::Busy`] unless the service is `Stopped`.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let cancel = {
            let mut lc = self.inner.lifecycle.lock().await;
            if lc.state != ServiceState::Stopped {
                return Err(ServiceError::Busy(lc.state));
            }
            if !self.inner.platform.has_consent() {
                let err = ServiceError::PermissionDenied;
                warn!("{}", err);
                self.inner.emit(err.event());
                return Err(err);
            }

            let cancel = CancelFlag::new();
            lc.cancel = Some(cancel.clone());
            self.inner.transition(&mut lc, ServiceState::Preparing);
            cancel
        };

        // The attempt runs on its own task so it always settles the lifecycle,
        // even when the caller stops polling this future.
        let service = self.clone();
        tokio::spawn(async move { service.finish_start(cancel).await })
            .await
            .map_err(ServiceError::task)?
    }

    /// Run a start attempt and settle the lifecycle on its outcome
    async fn finish_start(&self, cancel: CancelFlag) -> Result<(), ServiceError> {
        let result = self.run_start(&cancel).await;

        let mut lc = self.inner.lifecycle.lock().await;
        lc.cancel = None;

        match result {
            Ok(session) if cancel.is_cancelled() => {
                // Stop arrived after the engine came up
                drop(lc);
                self.inner.control.stop(session).await;
                let mut lc = self.inner.lifecycle.lock().await;
                self.inner.transition(&mut lc, ServiceState::Stopped);
                Err(EngineError::Cancelled.into())
            }
            Ok(session) => {
                let id = session.id();
                info!("VPN running (fd {})", session.fd());
                lc.session = Some(session);
                self.inner.transition(&mut lc, ServiceState::Running);
                drop(lc);
                self.spawn_monitor(id);
                Ok(())
            }
            Err(e) if cancel.is_cancelled() => {
                info!("VPN start cancelled");
                self.inner.transition(&mut lc, ServiceState::Stopped);
                Err(e)
            }
            Err(e) => {
                error!("VPN start failed: {}", e);
                self.inner.transition(&mut lc, ServiceState::Failed);
                self.inner.emit(e.event());
                self.inner.transition(&mut lc, ServiceState::Stopped);
                Err(e)
            }
        }
    }

    /// Resolve, establish and launch. Resources acquired here are released
    /// before an error is returned.
    async fn run_start(&self, cancel: &CancelFlag) -> Result<EngineSession, ServiceError> {
        let inner = &self.inner;

        let settings = inner.settings.clone();
        let own_package = inner.config.own_package.clone();
        let plan = tokio::task::spawn_blocking(move || -> Result<InterfacePlan, ServiceError> {
            let settings = settings.load()?;
            Ok(InterfacePlan::resolve(&settings, &own_package)?)
        })
        .await
        .map_err(ServiceError::task)??;

        {
            let mut lc = inner.lifecycle.lock().await;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled.into());
            }
            inner.transition(&mut lc, ServiceState::Establishing);
        }

        let platform = inner.platform.clone();
        let (plan, established) = tokio::task::spawn_blocking(move || {
            let mut builder = platform.builder();
            let established = tunnel::establish(&plan, builder.as_mut());
            (plan, established)
        })
        .await
        .map_err(ServiceError::task)?;
        let established = established?;

        let launch = plan.launch(established.handle.fd());
        let session = inner
            .control
            .start(established.handle, launch, inner.log_sink.clone(), cancel)
            .await?;

        Ok(session)
    }

    /// Stop the VPN.
    ///
    /// A no-op unless a start is in flight or a session is running. During a
    /// start the attempt is cancelled and unwinds on its own.
    pub async fn stop(&self) {
        let session = {
            let mut lc = self.inner.lifecycle.lock().await;
            match lc.state {
                ServiceState::Stopped | ServiceState::Stopping | ServiceState::Failed => {
                    debug!("Stop ignored ({:?})", lc.state);
                    return;
                }
                ServiceState::Preparing | ServiceState::Establishing => {
                    if let Some(cancel) = &lc.cancel {
                        cancel.cancel();
                    }
                    self.inner.transition(&mut lc, ServiceState::Stopping);
                    None
                }
                ServiceState::Running => {
                    self.inner.transition(&mut lc, ServiceState::Stopping);
                    lc.session.take()
                }
            }
        };

        match session {
            Some(session) => {
                self.inner.control.stop(session).await;
                let mut lc = self.inner.lifecycle.lock().await;
                self.inner.transition(&mut lc, ServiceState::Stopped);
                info!("VPN stopped");
            }
            // Unblock the engine if the start already reached it
            None => self.inner.control.halt().await,
        }
    }

    /// Engine counters, zero when not running
    pub async fn stats(&self) -> Result<EngineStats, ServiceError> {
        Ok(self.inner.control.stats().await?)
    }

    /// Format status for display
    pub async fn status(&self) -> String {
        let state = self.state().await;
        match self.stats().await {
            Ok(stats) => format!("VPN: {:?} | {}", state, stats.format()),
            Err(e) => format!("VPN: {:?} | {}", state, e),
        }
    }

    /// Receiver for UI notifications
    pub fn events(&self) -> Receiver<ServiceEvent> {
        self.inner.events_rx.clone()
    }

    /// Drain pending UI notifications
    pub fn poll_events(&self) -> Vec<ServiceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inner.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Poll engine health until the session ends
    fn spawn_monitor(&self, session_id: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.monitor_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.is_current(session_id).await {
                    break;
                }
                if inner.control.probe().await {
                    continue;
                }

                inner.fail_session(session_id, "engine stopped unexpectedly").await;
                break;
            }
            debug!("Engine monitor for session {} exited", session_id);
        });
    }
}

impl Inner {
    fn emit(&self, event: ServiceEvent) {
        // The receiver lives in `self`, so this cannot fail while we exist.
        let _ = self.events_tx.send(event);
    }

    fn transition(&self, lc: &mut Lifecycle, next: ServiceState) {
        if !lc.state.can_transition_to(next) {
            warn!("Unexpected VPN state change {:?} -> {:?}", lc.state, next);
        }
        info!("VPN state: {:?} -> {:?}", lc.state, next);
        lc.state = next;
        self.emit(ServiceEvent::StateChanged(next));
    }

    async fn is_current(&self, session_id: u64) -> bool {
        let lc = self.lifecycle.lock().await;
        lc.state.is_running() && lc.session.as_ref().is_some_and(|s| s.id() == session_id)
    }

    /// Running -> Failed -> Stopped for a session that died on its own
    async fn fail_session(&self, session_id: u64, reason: &str) {
        let session = {
            let mut lc = self.lifecycle.lock().await;
            let current = lc.state.is_running() && lc.session.as_ref().is_some_and(|s| s.id() == session_id);
            if !current {
                return;
            }
            error!("VPN session {} failed: {}", session_id, reason);
            self.transition(&mut lc, ServiceState::Failed);
            self.emit(ServiceEvent::VpnError(reason.to_string()));
            lc.session.take()
        };

        if let Some(session) = session {
            self.control.stop(session).await;
        }

        let mut lc = self.lifecycle.lock().await;
        self.transition(&mut lc, ServiceState::Stopped);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lc = self.lifecycle.get_mut();
        if let Some(cancel) = &lc.cancel {
            cancel.cancel();
        }
        if let Some(session) = lc.session.take() {
            warn!("VPN service dropped while running, tearing down session {}", session.id());
            self.control.stop_blocking(session);
        }

        self.pump_shutdown.take();
        if let Some(pump) = self.log_pump.take() {
            if pump.join().is_err() {
                warn!("Log pump panicked");
            }
        }
    }
}
