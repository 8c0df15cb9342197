//! Persistent TCP client connection to a peer
//!
//! A `ConnectionManager` dials a fixed endpoint, frames inbound bytes with
//! `JsonFrameCodec`, hands every frame to a `FrameHandler` and keeps the link
//! alive: whenever a dial fails or an established session ends, a single
//! background task re-dials according to the configured `RetryPolicy` until
//! it succeeds or the manager is shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::JsonFrameCodec;
use crate::error::{LineSrvError, Result};
use crate::runtime::retry::{retry, RetryError, RetryPolicy};

/// Receives decoded frames and link transitions
///
/// Callbacks run on the connection's reader task and must not block.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: Bytes);

    fn on_connected(&self) {}

    fn on_disconnected(&self) {}
}

/// Link state as observed by the rest of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection target and timing
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Peer label used in logs ("plc", "upper_computer")
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect: RetryPolicy,
    pub max_frame_length: usize,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy::fixed(Duration::from_secs(5)),
            max_frame_length: super::codec::DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub disconnects: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Inner {
    config: ConnectionConfig,
    handler: Arc<dyn FrameHandler>,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stats: Mutex<ConnectionStats>,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

/// Self-healing client connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.config.name)
            .field("address", &self.inner.config.address())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, handler: Arc<dyn FrameHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: RwLock::new(ConnectionState::Disconnected),
                writer: Mutex::new(None),
                stats: Mutex::new(ConnectionStats::default()),
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn address(&self) -> String {
        self.inner.config.address()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().clone()
    }

    /// Dial the peer once
    ///
    /// On failure a background reconnect is scheduled before the error is
    /// returned, so callers may treat the error as informational.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LineSrvError::internal(format!(
                "{} connection is shut down",
                self.name()
            )));
        }
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }

        match self.dial().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.schedule_reconnect();
                Err(e)
            },
        }
    }

    /// Queue one frame for the peer
    ///
    /// Fails immediately when no session is up; write errors surface as a
    /// session end and trigger a reconnect.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        let writer = self.inner.writer.lock();
        let Some(tx) = writer.as_ref() else {
            return Err(LineSrvError::not_connected(self.name()));
        };

        let len = payload.len() as u64;
        tx.send(payload)
            .map_err(|_| LineSrvError::not_connected(self.name()))?;

        let mut stats = self.inner.stats.lock();
        stats.frames_sent += 1;
        stats.bytes_sent += len + 1;
        Ok(())
    }

    /// Serialize `value` as JSON and queue it
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(Bytes::from(payload))
    }

    /// Close the session and stop reconnecting
    ///
    /// Idempotent. After shutdown the manager never dials again.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.writer.lock().take();
        *self.inner.state.write() = ConnectionState::Disconnected;
        info!("{}: connection shut down", self.name());
    }

    /// Open a session unless one is already up or being dialed
    ///
    /// Claiming CONNECTING under the state lock keeps an operator `connect`
    /// and the re-dial loop from opening two sessions.
    async fn dial(&self) -> Result<()> {
        let config = &self.inner.config;
        let addr = config.address();

        {
            let mut state = self.inner.state.write();
            if *state != ConnectionState::Disconnected {
                debug!("{}: already {:?}, not dialing", config.name, *state);
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.stats.lock().connect_attempts += 1;
        debug!("{}: connecting to {}", config.name, addr);

        let result = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(LineSrvError::transport(format!(
                "connect to {} failed: {}",
                addr, e
            ))),
            Err(_) => Err(LineSrvError::transport(format!(
                "connect to {} timed out after {:?}",
                addr, config.connect_timeout
            ))),
        };

        match result {
            Ok(stream) => {
                if self.inner.shutdown.is_cancelled() {
                    *self.inner.state.write() = ConnectionState::Disconnected;
                    return Err(LineSrvError::internal("shut down while connecting"));
                }
                configure_socket(&config.name, &stream);
                self.start_session(stream);
                Ok(())
            },
            Err(e) => {
                *self.inner.state.write() = ConnectionState::Disconnected;
                self.inner.stats.lock().last_error = Some(e.to_string());
                warn!("{}: {}", config.name, e);
                Err(e)
            },
        }
    }

    fn start_session(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.inner.shutdown.child_token();

        *self.inner.writer.lock() = Some(tx);
        *self.inner.state.write() = ConnectionState::Connected;
        {
            let mut stats = self.inner.stats.lock();
            stats.successful_connects += 1;
            stats.last_connected = Some(Utc::now());
            stats.last_error = None;
        }
        info!("{}: connected to {}", self.name(), self.address());
        self.inner.handler.on_connected();

        tokio::spawn(write_loop(
            self.inner.config.name.clone(),
            write_half,
            rx,
            session.clone(),
        ));

        let manager = self.clone();
        tokio::spawn(async move {
            manager.read_loop(read_half, session.clone()).await;
            session.cancel();
            manager.on_session_end();
        });
    }

    async fn read_loop(&self, read_half: OwnedReadHalf, session: CancellationToken) {
        let codec = JsonFrameCodec::with_max_length(self.inner.config.max_frame_length);
        let mut frames = FramedRead::new(read_half, codec);

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        self.inner.stats.lock().frames_received += 1;
                        self.inner.handler.on_frame(frame);
                    },
                    Some(Err(e)) => {
                        // Framing recovers from bad input on its own, so this is the socket
                        warn!("{}: read failed: {}", self.name(), e);
                        self.inner.stats.lock().last_error = Some(e.to_string());
                        break;
                    },
                    None => {
                        info!("{}: peer closed the connection", self.name());
                        break;
                    },
                },
            }
        }
    }

    fn on_session_end(&self) {
        self.inner.writer.lock().take();
        {
            let mut state = self.inner.state.write();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
            }
        }
        self.inner.stats.lock().disconnects += 1;
        self.inner.handler.on_disconnected();

        if !self.inner.shutdown.is_cancelled() {
            warn!("{}: disconnected from {}", self.name(), self.address());
            self.schedule_reconnect();
        }
    }

    /// Start the background re-dial loop unless one is already running
    fn schedule_reconnect(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.reconnecting.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let policy = manager.inner.config.reconnect.clone();
            let shutdown = manager.inner.shutdown.clone();
            info!(
                "{}: reconnecting to {} in {:?}",
                manager.name(),
                manager.address(),
                policy.initial_delay
            );

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => Err(RetryError::Cancelled),
                _ = tokio::time::sleep(policy.initial_delay) => {
                    let label = format!("{} reconnect", manager.name());
                    retry(&policy, &shutdown, &label, |_| manager.dial()).await
                },
            };

            manager.inner.reconnecting.store(false, Ordering::SeqCst);

            match outcome {
                Ok(()) => {
                    // The new session may already have dropped while the flag was held
                    if manager.state() == ConnectionState::Disconnected {
                        manager.schedule_reconnect();
                    }
                },
                Err(RetryError::Cancelled) => debug!("{}: reconnect cancelled", manager.name()),
                Err(e) => error!("{}: {}", manager.name(), e),
            }
        });
    }
}

async fn write_loop(
    name: String,
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    session: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, JsonFrameCodec::new());

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            next = rx.recv() => match next {
                Some(payload) => {
                    if let Err(e) = sink.send(payload).await {
                        warn!("{}: write failed: {}", name, e);
                        session.cancel();
                        break;
                    }
                },
                None => break,
            },
        }
    }
}

/// Configure TCP socket options
fn configure_socket(name: &str, stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("{}: failed to set TCP_NODELAY: {}", name, e);
    }

    let socket = socket2::SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!("{}: failed to set keep-alive: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl FrameHandler for NullHandler {
        fn on_frame(&self, _frame: Bytes) {}
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_disconnected() {
        let manager = ConnectionManager::new(
            ConnectionConfig::new("plc", "127.0.0.1", 1),
            Arc::new(NullHandler),
        );

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let err = manager.send(Bytes::from_static(b"{}")).unwrap_err();
        assert!(matches!(err, LineSrvError::NotConnected(ref peer) if peer == "plc"));
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_is_rejected() {
        let manager = ConnectionManager::new(
            ConnectionConfig::new("upper_computer", "127.0.0.1", 1),
            Arc::new(NullHandler),
        );
        manager.shutdown();
        manager.shutdown();

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.stats().connect_attempts, 0);
    }

    #[test]
    fn test_address() {
        let config = ConnectionConfig::new("plc", "10.0.0.5", 502);
        assert_eq!(config.address(), "10.0.0.5:502");
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(5));
    }
}
