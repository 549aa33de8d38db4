//! Passkey hand-off between pairing and whichever UI is active.
//!
//! Pairing an Aranet4 requires typing the six-digit passkey shown on the
//! device's screen. The pairing procedure asks the [`PasskeyMediator`] for a
//! passkey and blocks; the terminal prompt and the web status page both act as
//! producers and race to deliver one.
//!
//! The mediator is a two-state machine:
//!
//! - [`PasskeyState::Idle`]: no pairing attempt is waiting. Submissions fail
//!   with [`PasskeyError::NoPasskeyRequest`].
//! - [`PasskeyState::AwaitingPasskey`]: exactly one pairing attempt is waiting.
//!   The first submission it claims wins; a submission it does not claim within
//!   the submit timeout fails with [`PasskeyError::PasskeyDeliveryTimeout`].
//!
//! A [`PasskeyRequest`] guard owns the waiting side. Dropping it, whether
//! after success, timeout or cancellation, returns the mediator to `Idle`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use aranet_collector::passkey::PasskeyMediator;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mediator = PasskeyMediator::new();
//!
//! let producer = mediator.clone();
//! tokio::spawn(async move {
//!     while !producer.is_awaiting() {
//!         tokio::task::yield_now().await;
//!     }
//!     producer.submit(123456).await.unwrap();
//! });
//!
//! let passkey = mediator.request_passkey(Duration::from_secs(10)).await.unwrap();
//! assert_eq!(passkey, 123456);
//! assert!(!mediator.is_awaiting());
//! # }
//! ```

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a producer waits for the pairing procedure to claim a passkey.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest valid passkey (six decimal digits).
pub const MAX_PASSKEY: u32 = 999_999;

/// Passkey errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PasskeyError {
    /// A passkey was submitted while no pairing attempt was waiting.
    #[error("no passkey request pending")]
    NoPasskeyRequest,
    /// The pairing procedure did not claim the passkey in time.
    #[error("timeout sending passkey after {0:?}")]
    PasskeyDeliveryTimeout(Duration),
    /// A second pairing attempt asked for a passkey while one was waiting.
    #[error("another pairing attempt is already waiting for a passkey")]
    PairingInProgress,
    /// Nobody supplied a passkey before the pairing procedure gave up.
    #[error("no passkey received within {0:?}")]
    PairingTimeout(Duration),
    /// The submitted form had no passkey.
    #[error("passkey is required")]
    Missing,
    /// The submitted text is not a passkey.
    #[error("passkey must be a number of at most 6 digits")]
    Malformed,
}

/// Parse user input as a passkey: 1 to 6 decimal digits, surrounding
/// whitespace ignored.
pub fn parse_passkey(input: &str) -> Result<u32, PasskeyError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PasskeyError::Missing);
    }
    if input.len() > 6 || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PasskeyError::Malformed);
    }
    input.parse().map_err(|_| PasskeyError::Malformed)
}

/// A passkey plus the acknowledgement the producer waits on.
type Delivery = (u32, oneshot::Sender<()>);

/// Handle to the single waiting pairing attempt.
#[derive(Debug)]
pub struct PasskeySlot {
    id: u64,
    tx: mpsc::Sender<Delivery>,
    requested_at: OffsetDateTime,
}

/// Mediator state.
#[derive(Debug, Default)]
pub enum PasskeyState {
    /// No pairing attempt is waiting.
    #[default]
    Idle,
    /// A pairing attempt is waiting for input.
    AwaitingPasskey(PasskeySlot),
}

#[derive(Debug)]
struct Inner {
    state: Mutex<PasskeyState>,
    awaiting_tx: watch::Sender<bool>,
    next_id: AtomicU64,
    submit_timeout: Duration,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PasskeyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-slot rendezvous for pairing passkeys.
///
/// Cheap to clone; all clones share the same slot.
#[derive(Debug, Clone)]
pub struct PasskeyMediator {
    inner: Arc<Inner>,
}

impl Default for PasskeyMediator {
    fn default() -> Self {
        Self::new()
    }
}

impl PasskeyMediator {
    /// Create an idle mediator with the default submit timeout.
    pub fn new() -> Self {
        Self::with_submit_timeout(DEFAULT_SUBMIT_TIMEOUT)
    }

    /// Create an idle mediator with a custom submit timeout.
    pub fn with_submit_timeout(submit_timeout: Duration) -> Self {
        let (awaiting_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PasskeyState::Idle),
                awaiting_tx,
                next_id: AtomicU64::new(1),
                submit_timeout,
            }),
        }
    }

    /// Whether a pairing attempt is waiting for a passkey.
    pub fn is_awaiting(&self) -> bool {
        matches!(*self.inner.state(), PasskeyState::AwaitingPasskey(_))
    }

    /// When the waiting pairing attempt asked for its passkey.
    pub fn requested_at(&self) -> Option<OffsetDateTime> {
        match &*self.inner.state() {
            PasskeyState::AwaitingPasskey(slot) => Some(slot.requested_at),
            PasskeyState::Idle => None,
        }
    }

    /// Watch the awaiting flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.awaiting_tx.subscribe()
    }

    /// Move to `AwaitingPasskey` and return the guard that receives the
    /// passkey.
    pub fn begin(&self) -> Result<PasskeyRequest, PasskeyError> {
        let mut state = self.inner.state();
        if matches!(*state, PasskeyState::AwaitingPasskey(_)) {
            return Err(PasskeyError::PairingInProgress);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        *state = PasskeyState::AwaitingPasskey(PasskeySlot {
            id,
            tx,
            requested_at: OffsetDateTime::now_utc(),
        });
        drop(state);
        self.inner.awaiting_tx.send_replace(true);
        Ok(PasskeyRequest {
            inner: Arc::clone(&self.inner),
            id,
            rx,
        })
    }

    /// Ask for a passkey and wait up to `timeout` for one.
    ///
    /// The mediator is `Idle` again when this returns, whatever the outcome.
    pub async fn request_passkey(&self, timeout: Duration) -> Result<u32, PasskeyError> {
        let request = self.begin()?;
        info!("waiting for passkey, enter it in the terminal or on the status page");
        request.wait(timeout).await
    }

    /// Deliver a passkey to the waiting pairing attempt.
    ///
    /// Blocks until the pairing attempt claims the value, for at most the
    /// submit timeout.
    pub async fn submit(&self, passkey: u32) -> Result<(), PasskeyError> {
        let tx = match &*self.inner.state() {
            PasskeyState::AwaitingPasskey(slot) => slot.tx.clone(),
            PasskeyState::Idle => return Err(PasskeyError::NoPasskeyRequest),
        };

        let budget = self.inner.submit_timeout;
        let delivery = async {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send((passkey, ack_tx))
                .await
                .map_err(|_| PasskeyError::NoPasskeyRequest)?;
            ack_rx.await.map_err(|_| PasskeyError::NoPasskeyRequest)
        };
        match tokio::time::timeout(budget, delivery).await {
            Ok(result) => result,
            Err(_) => Err(PasskeyError::PasskeyDeliveryTimeout(budget)),
        }
    }
}

/// The waiting side of a pairing attempt.
///
/// Returns the mediator to `Idle` when dropped.
#[derive(Debug)]
pub struct PasskeyRequest {
    inner: Arc<Inner>,
    id: u64,
    rx: mpsc::Receiver<Delivery>,
}

impl PasskeyRequest {
    /// Wait up to `timeout` for a passkey.
    pub async fn wait(mut self, timeout: Duration) -> Result<u32, PasskeyError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(passkey)) => Ok(passkey),
            Ok(None) | Err(_) => Err(PasskeyError::PairingTimeout(timeout)),
        }
    }

    async fn recv(&mut self) -> Option<u32> {
        while let Some((passkey, ack)) = self.rx.recv().await {
            if ack.send(()).is_ok() {
                return Some(passkey);
            }
            // The producer already gave up and was told so.
            debug!("discarding passkey whose submitter timed out");
        }
        None
    }
}

impl Drop for PasskeyRequest {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if matches!(&*state, PasskeyState::AwaitingPasskey(slot) if slot.id == self.id) {
            *state = PasskeyState::Idle;
            drop(state);
            self.inner.awaiting_tx.send_replace(false);
        }
    }
}

/// Spawn the terminal passkey prompt on stdin.
pub fn spawn_terminal_prompt(mediator: PasskeyMediator) -> JoinHandle<()> {
    tokio::spawn(run_terminal_prompt(
        mediator,
        std::io::BufReader::new(std::io::stdin()),
        std::io::stdout(),
    ))
}

/// Read lines from `reader` on a dedicated, detached thread.
///
/// A read blocked on the terminal must not hold up runtime shutdown, which
/// waits for tasks on the blocking pool but not for plain threads.
fn spawn_line_reader<R>(reader: R) -> io::Result<mpsc::Receiver<io::Result<String>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    std::thread::Builder::new()
        .name("passkey-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                if tx.blocking_send(line).is_err() {
                    return;
                }
            }
        })?;
    Ok(rx)
}

/// Prompt for a passkey whenever a pairing attempt is waiting.
///
/// Malformed input is reported and the prompt repeated. Returns when the
/// input reaches end of file.
pub async fn run_terminal_prompt<R, W>(mediator: PasskeyMediator, reader: R, mut out: W)
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let mut lines = match spawn_line_reader(reader) {
        Ok(lines) => lines,
        Err(e) => {
            warn!(error = %e, "failed to start terminal passkey reader");
            return;
        }
    };
    let mut awaiting = mediator.subscribe();
    loop {
        if awaiting.wait_for(|waiting| *waiting).await.is_err() {
            return;
        }

        let _ = write!(out, "Enter passkey: ");
        let _ = out.flush();

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = async { awaiting.wait_for(|waiting| !*waiting).await.is_ok() } => {
                // Answered elsewhere or abandoned.
                let _ = writeln!(out);
                continue;
            }
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "failed to read passkey from terminal");
                return;
            }
            None => {
                debug!("terminal input closed");
                return;
            }
        };

        let passkey = match parse_passkey(&line) {
            Ok(passkey) => passkey,
            Err(e) => {
                let _ = writeln!(out, "ERROR: {e}");
                continue;
            }
        };
        match mediator.submit(passkey).await {
            Ok(()) => {
                info!("passkey received via terminal");
                let _ = awaiting.wait_for(|waiting| !*waiting).await;
            }
            Err(PasskeyError::NoPasskeyRequest) => {
                let _ = writeln!(out, "No passkey request pending.");
            }
            Err(e) => {
                let _ = writeln!(out, "ERROR: {e}");
            }
        }
    }
}
