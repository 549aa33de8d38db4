//! Application state shared between the refresh loop and the web handlers.
//!
//! The refresh loop is the only writer of [`CollectorState`]; handlers read it
//! to render the status page. Timestamps are stored as Unix milliseconds in
//! atomics, with 0 meaning "never".

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use prometheus::Registry;
use time::OffsetDateTime;
use tokio::sync::{Notify, watch};

use crate::config::Config;
use crate::passkey::PasskeyMediator;

/// Shared application state.
pub struct AppState {
    /// Configuration, fixed at startup.
    pub config: Config,
    /// Metrics exposed on `/metrics`.
    pub registry: Registry,
    /// Passkey hand-off for pairing.
    pub mediator: PasskeyMediator,
    /// Refresh loop status and control.
    pub collector: CollectorState,
}

impl AppState {
    /// Create new application state.
    pub fn new(config: Config) -> Arc<Self> {
        let mediator = PasskeyMediator::with_submit_timeout(config.pairing.submit_timeout());
        Self::with_mediator(config, mediator)
    }

    /// Create state around an existing mediator.
    pub fn with_mediator(config: Config, mediator: PasskeyMediator) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            mediator,
            collector: CollectorState::new(),
        })
    }
}

/// Status and control of the refresh loop.
pub struct CollectorState {
    running: AtomicBool,
    last_success_ms: AtomicI64,
    last_reported_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    refresh: Notify,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

fn store_time(slot: &AtomicI64, ts: OffsetDateTime) {
    let ms = (ts.unix_timestamp_nanos() / 1_000_000) as i64;
    slot.store(ms, Ordering::SeqCst);
}

fn load_time(slot: &AtomicI64) -> Option<OffsetDateTime> {
    match slot.load(Ordering::SeqCst) {
        0 => None,
        ms => OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok(),
    }
}

impl CollectorState {
    /// Create a new collector state.
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            running: AtomicBool::new(false),
            last_success_ms: AtomicI64::new(0),
            last_reported_ms: AtomicI64::new(0),
            last_error: Mutex::new(None),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            refresh: Notify::new(),
            stop_tx,
            stop_rx,
        }
    }

    /// Check if the refresh loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// When the last refresh cycle succeeded.
    pub fn last_success(&self) -> Option<OffsetDateTime> {
        load_time(&self.last_success_ms)
    }

    /// Timestamp of the newest record processed by a successful cycle.
    pub fn last_reported(&self) -> Option<OffsetDateTime> {
        load_time(&self.last_reported_ms)
    }

    /// Message of the last failed cycle, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Record a successful cycle finishing at `at`.
    pub fn record_success(&self, at: OffsetDateTime, last_reported: Option<OffsetDateTime>) {
        store_time(&self.last_success_ms, at);
        if let Some(ts) = last_reported {
            store_time(&self.last_reported_ms, ts);
        }
        self.success_count.fetch_add(1, Ordering::SeqCst);
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Record a failed cycle.
    pub fn record_failure(&self, error: String) {
        self.failure_count.fetch_add(1, Ordering::SeqCst);
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    /// Ask the refresh loop to run a cycle now.
    ///
    /// A request made while a cycle is running wakes the following wait.
    pub fn trigger_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Resolves when a refresh is requested.
    pub async fn refresh_requested(&self) {
        self.refresh.notified().await;
    }

    /// Get a receiver for the stop signal.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Signal the refresh loop to stop.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Default for CollectorState {
    fn default() -> Self {
        Self::new()
    }
}
