//! Mock reading source for testing.
//!
//! [`MockSource`] implements [`ReadingSource`] without any device, so the
//! collector can be exercised end to end.
//!
//! # Features
//!
//! - **Failure injection**: fail every acquisition, or only the next N
//! - **Latency simulation**: delay acquisitions, e.g. to exercise timeouts
//! - **Pairing**: require a passkey through the [`PasskeyMediator`] before
//!   the first successful acquisition, like an unbonded Aranet4
//! - **Live mode**: append a fresh reading on every acquisition, keeping at
//!   most [`MAX_HISTORY_RECORDS`] like the device does

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{info, warn};

use aranet_types::Reading;

use crate::passkey::PasskeyMediator;
use crate::source::{Acquisition, AcquisitionError, ReadingSource};

/// Records an Aranet4 keeps in its on-device history.
pub const MAX_HISTORY_RECORDS: usize = 2016;

/// Pairing behaviour of a [`MockSource`].
#[derive(Debug)]
struct MockPairing {
    mediator: PasskeyMediator,
    passkey: u32,
    timeout: Duration,
    bonded: AtomicBool,
}

/// An in-memory reading source.
#[derive(Debug, Default)]
pub struct MockSource {
    latest: RwLock<Option<Reading>>,
    history: RwLock<Vec<Reading>>,
    acquire_count: AtomicU32,
    should_fail: AtomicBool,
    fail_message: RwLock<String>,
    /// Number of acquisitions to fail before succeeding.
    remaining_failures: AtomicU32,
    /// Simulated latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
    live: AtomicBool,
    /// Oldest records beyond this count are dropped in live mode.
    history_limit: Option<usize>,
    pairing: Option<MockPairing>,
}

impl MockSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// A source with an hour of plausible five-minute history that also adds
    /// a new reading on every acquisition.
    pub fn demo() -> Self {
        let now = OffsetDateTime::now_utc();
        let history = (1..=12u8)
            .rev()
            .map(|i| demo_reading(now - Duration::from_secs(u64::from(i) * 300), i))
            .collect::<Vec<_>>();
        let source = Self::new()
            .with_history(history)
            .with_history_limit(MAX_HISTORY_RECORDS);
        source.live.store(true, Ordering::SeqCst);
        source
    }

    /// Set the initial history.
    pub fn with_history(mut self, history: Vec<Reading>) -> Self {
        self.history = RwLock::new(history);
        self
    }

    /// Keep at most `limit` records when live mode appends new ones.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Set the initial latest reading.
    pub fn with_latest(mut self, latest: Reading) -> Self {
        self.latest = RwLock::new(Some(latest));
        self
    }

    /// Require pairing with `passkey` before readings are returned.
    ///
    /// Each unbonded acquisition asks `mediator` for a passkey and waits up to
    /// `timeout` for it.
    pub fn with_pairing(mut self, mediator: PasskeyMediator, passkey: u32, timeout: Duration) -> Self {
        self.pairing = Some(MockPairing {
            mediator,
            passkey,
            timeout,
            bonded: AtomicBool::new(false),
        });
        self
    }

    /// Replace the history.
    pub async fn set_history(&self, history: Vec<Reading>) {
        *self.history.write().await = history;
    }

    /// Add a record to the history.
    pub async fn push_history(&self, reading: Reading) {
        self.history.write().await.push(reading);
    }

    /// Replace the latest reading.
    pub async fn set_latest(&self, latest: Option<Reading>) {
        *self.latest.write().await = latest;
    }

    /// Make every acquisition fail with `message`.
    pub async fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::SeqCst);
        if let Some(message) = message {
            *self.fail_message.write().await = message.to_string();
        }
    }

    /// Fail the next `count` acquisitions, then succeed.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every acquisition by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of acquisitions attempted.
    pub fn acquire_count(&self) -> u32 {
        self.acquire_count.load(Ordering::SeqCst)
    }

    /// Whether pairing has completed (always `true` without pairing).
    pub fn is_bonded(&self) -> bool {
        self.pairing
            .as_ref()
            .is_none_or(|p| p.bonded.load(Ordering::SeqCst))
    }

    async fn check_failure(&self) -> Result<(), AcquisitionError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(AcquisitionError::Device(format!(
                "injected failure ({} remaining)",
                remaining - 1
            )));
        }
        if self.should_fail.load(Ordering::SeqCst) {
            let message = self.fail_message.read().await.clone();
            let message = if message.is_empty() {
                "mock failure".to_string()
            } else {
                message
            };
            return Err(AcquisitionError::Device(message));
        }
        Ok(())
    }

    async fn pair(&self, pairing: &MockPairing) -> Result<(), AcquisitionError> {
        while !pairing.bonded.load(Ordering::SeqCst) {
            warn!("no bond found, pairing");
            let passkey = pairing.mediator.request_passkey(pairing.timeout).await?;
            if passkey != pairing.passkey {
                return Err(AcquisitionError::Device(
                    "pairing rejected: wrong passkey".to_string(),
                ));
            }
            pairing.bonded.store(true, Ordering::SeqCst);
            info!("paired");
        }
        Ok(())
    }
}

fn demo_reading(timestamp: OffsetDateTime, step: u8) -> Reading {
    let step = f64::from(step);
    Reading::builder()
        .timestamp(timestamp)
        .co2(550 + (step * 7.0) as i32)
        .temperature(21.0 + step * 0.05)
        .pressure(1012.5 + step * 0.1)
        .humidity(40.0 + step * 0.2)
        .battery(90)
        .build()
}

#[async_trait]
impl ReadingSource for MockSource {
    async fn acquire(&self) -> Result<Acquisition, AcquisitionError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let count = self.acquire_count.fetch_add(1, Ordering::SeqCst) + 1;

        self.check_failure().await?;
        if let Some(pairing) = &self.pairing {
            self.pair(pairing).await?;
        }

        if self.live.load(Ordering::SeqCst) {
            let reading = demo_reading(OffsetDateTime::now_utc(), (count % 20) as u8);
            *self.latest.write().await = Some(reading.clone());
            let mut history = self.history.write().await;
            history.push(reading);
            if let Some(limit) = self.history_limit
                && history.len() > limit
            {
                let excess = history.len() - limit;
                history.drain(..excess);
            }
        }

        Ok(Acquisition {
            latest: self.latest.read().await.clone(),
            history: self.history.read().await.clone(),
        })
    }

    fn describe(&self) -> String {
        "mock device".to_string()
    }
}
