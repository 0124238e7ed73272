//! Connection manager: one long-lived socket with single-flight reconnects.
//!
//! ```text
//!                 ensure_connected / reconnect
//! ┌──────────────┐  (claims the dial)   ┌────────────┐
//! │ Disconnected │─────────────────────▶│ Connecting │◀─┐ backoff
//! └──────────────┘                      └─────┬──────┘──┘
//!        ▲        attempt cap reached         │ dial ok
//!        ├────────────────────────────────────┤
//!        │  peer closed / timeout / close()   ▼
//!        │                              ┌────────────┐
//!        └──────────────────────────────│ Connected  │
//!                                       └────────────┘
//! ```
//!
//! The `Connecting` state doubles as the reconnect permit: it is claimed
//! atomically through the state channel, so at most one dial runs per
//! manager. The dial itself runs on a detached task. Callers wait on the
//! state channel for a bounded time and then re-check.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use f2b_exporter_config::AppConfig;

use super::transport::{self, SentinelScan, TransportError};
use super::value::Command;
use crate::BoxFuture;

/// Opens new sockets to the daemon.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial(&self) -> BoxFuture<'_, io::Result<Self::Stream>>;

    /// Human-readable target for log lines.
    fn endpoint(&self) -> String {
        "fail2ban".to_string()
    }
}

impl<D: Dialer> Dialer for Arc<D> {
    type Stream = D::Stream;

    fn dial(&self) -> BoxFuture<'_, io::Result<Self::Stream>> {
        (**self).dial()
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}

/// Dials the fail2ban Unix socket.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Dialer for UnixDialer {
    type Stream = UnixStream;

    fn dial(&self) -> BoxFuture<'_, io::Result<UnixStream>> {
        Box::pin(UnixStream::connect(&self.path))
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}

/// Exponential backoff between dial attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// Delay after the given failed attempt (0-indexed).
    #[allow(
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_ms = self.initial.as_millis() as f64 * factor;
        let capped_ms = delay_ms.min(self.max.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Runtime settings for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub scan: SentinelScan,
    /// Bound on one send-and-receive exchange.
    pub read_timeout: Duration,
    /// Bound on one connect call.
    pub dial_timeout: Duration,
    /// How long a caller waits for an in-flight dial.
    pub connect_wait: Duration,
    pub backoff: Backoff,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan: SentinelScan::default(),
            read_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(2),
            connect_wait: Duration::from_secs(3),
            backoff: Backoff::default(),
        }
    }
}

impl From<&AppConfig> for ConnectionConfig {
    fn from(config: &AppConfig) -> Self {
        let reconnect = &config.reconnect;
        Self {
            scan: config.socket.sentinel_scan.parse().unwrap_or_default(),
            read_timeout: config.socket.read_timeout(),
            dial_timeout: reconnect.dial_timeout(),
            connect_wait: reconnect.connect_wait(),
            backoff: Backoff {
                initial: reconnect.initial_interval(),
                multiplier: reconnect.multiplier,
                max: reconnect.max_interval(),
                max_attempts: reconnect.max_attempts,
            },
        }
    }
}

/// Liveness of the daemon socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Failure to (re)establish the socket.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("gave up connecting to fail2ban after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("fail2ban socket still not connected after waiting {0:?}")]
    Pending(Duration),
}

/// Failure of one command/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection to fail2ban was reset and re-established; retry the request")]
    RetryLater,
}

struct Inner<D: Dialer> {
    dialer: D,
    config: ConnectionConfig,
    stream: Mutex<Option<D::Stream>>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
}

/// Owns the daemon socket and keeps it connected.
pub struct ConnectionManager<D: Dialer = UnixDialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionManager<UnixDialer> {
    /// Manager for the socket and settings named in `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            UnixDialer::new(&config.socket.path),
            ConnectionConfig::from(config),
        )
    }
}

impl<D: Dialer> ConnectionManager<D> {
    /// Create a manager. No socket is opened until the first request.
    pub fn new(dialer: D, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                dialer,
                config,
                stream: Mutex::new(None),
                state,
                attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Make sure a live socket is installed, reconnecting if needed.
    pub async fn ensure_connected(&self) -> Result<(), ConnectError> {
        if self.state() == ConnectionState::Connected && self.probe().await {
            return Ok(());
        }
        self.reconnect().await
    }

    /// Start a dial unless one is already running, then wait for the
    /// running dial to finish (bounded by `connect_wait`).
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        let mut rx = self.inner.state.subscribe();

        if self.inner.claim_dial() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.dial_until_connected().await });
        } else {
            debug!("reconnect already in flight");
        }

        let wait = self.inner.config.connect_wait;
        let settled = tokio::time::timeout(
            wait,
            rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;

        match settled {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(Ok(_)) => Err(ConnectError::Exhausted {
                attempts: self.inner.attempts.load(Ordering::Relaxed),
            }),
            Ok(Err(_)) | Err(_) => Err(ConnectError::Pending(wait)),
        }
    }

    /// Send `cmd` and return the raw response preceding the end sentinel.
    ///
    /// The socket is held exclusively for the whole exchange. If the peer
    /// turns out to be gone, one reconnect is triggered and the caller gets
    /// [`RequestError::RetryLater`] (or the reconnect's failure) rather than
    /// the transport error.
    ///
    /// The socket is taken out of its slot while the exchange runs and only
    /// put back once a full response has been read, so dropping this future
    /// mid-exchange discards the socket instead of leaving a reply queued
    /// for the next command.
    pub async fn exchange(&self, cmd: &Command) -> Result<Vec<u8>, RequestError> {
        self.ensure_connected().await?;

        let mut slot = self.inner.stream.lock().await;
        let Some(mut stream) = slot.take() else {
            // Another request dropped the socket between our check and the lock.
            drop(slot);
            self.inner.mark_disconnected();
            return Err(RequestError::RetryLater);
        };

        let read_timeout = self.inner.config.read_timeout;
        let scan = self.inner.config.scan;
        let result = tokio::time::timeout(read_timeout, async {
            transport::send_command(&mut stream, cmd).await?;
            transport::receive_response(&mut stream, scan).await
        })
        .await
        .unwrap_or(Err(TransportError::Timeout(read_timeout)));

        match result {
            Ok(bytes) => {
                *slot = Some(stream);
                Ok(bytes)
            }
            Err(TransportError::PeerClosed) => {
                drop(stream);
                drop(slot);
                self.inner.mark_disconnected();
                warn!(command = %cmd, "fail2ban closed the connection, reconnecting");
                self.reconnect().await?;
                Err(RequestError::RetryLater)
            }
            Err(err @ TransportError::Encoding(_)) => {
                // Nothing was written.
                *slot = Some(stream);
                Err(err.into())
            }
            Err(err) => {
                // The framing state of the socket is unknown now.
                drop(slot);
                self.inner.mark_disconnected();
                self.inner.discard(Some(stream)).await;
                warn!(command = %cmd, error = %err, "dropped fail2ban connection");
                Err(err.into())
            }
        }
    }

    /// Close the session with the daemon. Safe to call repeatedly.
    pub async fn close(&self) {
        let stream = self.inner.stream.lock().await.take();
        self.inner.mark_disconnected();
        self.inner.discard(stream).await;
    }

    /// Zero-length write on the current socket.
    ///
    /// This only catches sockets the OS already knows are dead; a half-open
    /// peer passes. Reads that hit end-of-stream catch the rest.
    async fn probe(&self) -> bool {
        let mut slot = self.inner.stream.lock().await;
        let alive = match slot.as_mut() {
            Some(stream) => stream.write(&[]).await.is_ok(),
            None => false,
        };
        if !alive {
            slot.take();
            drop(slot);
            self.inner.mark_disconnected();
            debug!("liveness probe failed");
        }
        alive
    }
}

impl<D: Dialer> Inner<D> {
    /// Claim the dial permit: move to `Connecting` unless already there.
    fn claim_dial(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                false
            } else {
                *state = ConnectionState::Connecting;
                true
            }
        })
    }

    /// Send the close sentinel and drop the socket. A peer that stopped
    /// reading gets `read_timeout` to take it before the socket is dropped
    /// anyway.
    async fn discard(&self, stream: Option<D::Stream>) {
        let limit = self.config.read_timeout;
        if tokio::time::timeout(limit, transport::close_session(stream))
            .await
            .is_err()
        {
            debug!(timeout_ms = limit.as_millis() as u64, "close sentinel not accepted in time");
        }
    }

    fn mark_disconnected(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    async fn dial_until_connected(self: Arc<Self>) {
        let round = DialRound { state: &self.state };
        let endpoint = self.dialer.endpoint();
        let backoff = &self.config.backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.attempts.store(attempt, Ordering::Relaxed);

            let dialed = tokio::time::timeout(self.config.dial_timeout, self.dialer.dial())
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")));

            match dialed {
                Ok(stream) => {
                    let stale = self.stream.lock().await.replace(stream);
                    self.discard(stale).await;
                    round.finish(ConnectionState::Connected);
                    info!(endpoint = %endpoint, attempt, "connected to fail2ban");
                    return;
                }
                Err(err) if backoff.is_exhausted(attempt) => {
                    error!(endpoint = %endpoint, attempts = attempt, error = %err, "giving up on fail2ban socket");
                    round.finish(ConnectionState::Disconnected);
                    return;
                }
                Err(err) => {
                    let delay = backoff.delay(attempt - 1);
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to connect to fail2ban"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Releases the dial permit if the dial task ends without settling the
/// state (panic, or the runtime dropping the task).
struct DialRound<'a> {
    state: &'a watch::Sender<ConnectionState>,
}

impl DialRound<'_> {
    fn finish(self, outcome: ConnectionState) {
        self.state.send_replace(outcome);
    }
}

impl Drop for DialRound<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}
