//! Test doubles for the engine and the platform

use crate::engine::{EngineError, EngineLaunch, EngineStats, ForwardingEngine, LogSink};
use crate::service::VpnPlatform;
use crate::tunnel::{CallLog, DryRunBuilder, InterfaceBuilder};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Scriptable forwarding engine
#[derive(Default)]
pub(crate) struct FakeEngine {
    failure: Option<String>,
    start_delay: Duration,
    running: AtomicBool,
    stop_requested: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    stats: Mutex<EngineStats>,
    last_launch: Mutex<Option<EngineLaunch>>,
    /// Kept like a real engine would, past the service's lifetime
    sink: Mutex<Option<LogSink>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every start fails with `reason`
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Start blocks this long unless stopped
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn set_stats(&self, stats: EngineStats) {
        *self.stats.lock().unwrap() = stats;
    }

    /// Simulate the engine dying on its own
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_launch(&self) -> Option<EngineLaunch> {
        self.last_launch.lock().unwrap().clone()
    }

    /// Log through the sink from the last start
    pub fn emit_log(&self, message: &str) -> bool {
        self.sink.lock().unwrap().as_ref().is_some_and(|sink| sink.log(message))
    }
}

impl ForwardingEngine for FakeEngine {
    fn start(&self, launch: &EngineLaunch, logs: LogSink) -> Result<(), EngineError> {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.starts.fetch_add(1, Ordering::SeqCst);

        let deadline = Instant::now() + self.start_delay;
        while Instant::now() < deadline {
            if self.stop_requested.load(Ordering::SeqCst) {
                return Err(EngineError::StartFailure("interrupted".to_string()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Some(reason) = &self.failure {
            return Err(EngineError::StartFailure(reason.clone()));
        }

        *self.last_launch.lock().unwrap() = Some(launch.clone());
        self.running.store(true, Ordering::SeqCst);
        logs.log(format!("{} forwarding started on fd {}", launch.protocol, launch.fd));
        *self.sink.lock().unwrap() = Some(logs);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn stats(&self) -> EngineStats {
        *self.stats.lock().unwrap()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Platform handing out [`DryRunBuilder`]s
pub(crate) struct FakePlatform {
    consent: AtomicBool,
    refuse: Option<String>,
    next_fd: AtomicI32,
    logs: Mutex<Vec<CallLog>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            consent: AtomicBool::new(true),
            refuse: None,
            next_fd: AtomicI32::new(100),
            logs: Mutex::new(Vec::new()),
        }
    }

    pub fn without_consent() -> Self {
        let platform = Self::new();
        platform.consent.store(false, Ordering::SeqCst);
        platform
    }

    /// Every establish fails with `reason`
    pub fn refusing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::new()
        }
    }

    /// Number of builders handed out
    pub fn builders(&self) -> usize {
        self.logs.lock().unwrap().len()
    }

    pub fn last_log(&self) -> Option<CallLog> {
        self.logs.lock().unwrap().last().cloned()
    }

    /// Closes across every interface handed out
    pub fn closes(&self) -> usize {
        self.logs.lock().unwrap().iter().map(|l| l.closes()).sum()
    }
}

impl VpnPlatform for FakePlatform {
    fn has_consent(&self) -> bool {
        self.consent.load(Ordering::SeqCst)
    }

    fn builder(&self) -> Box<dyn InterfaceBuilder + Send> {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        let mut builder = DryRunBuilder::new().with_fd(fd);
        if let Some(reason) = &self.refuse {
            builder = builder.refuse_establish(reason);
        }
        self.logs.lock().unwrap().push(builder.call_log());
        Box::new(builder)
    }
}
