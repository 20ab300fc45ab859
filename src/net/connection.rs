//! Connection state machine and the transport-independent connection contract.
//!
//! # Responsibilities
//! - Track connection state (NotConnected → Connecting → Connected →
//!   Disconnecting → NotConnected)
//! - Provide the readiness wait that `connect` blocks on
//! - Deliver inbound messages to observers off the socket tasks
//! - Raise the disconnection event at most once
//!
//! Transports implement [`Connection`]; everything they share lives in
//! [`ConnectionCore`], which each transport owns by composition.

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;

use crate::config::ConnectionConfig;
use crate::crypto::CipherFactory;
use crate::net::endpoint::ConnectionEndpoint;
use crate::net::event::{DataReceived, Disconnected, Observers};
use crate::net::keepalive::{KeepaliveTimer, DEFAULT_KEEP_ALIVE_INTERVAL};
use crate::net::statistics::ConnectionStatistics;
use crate::net::wire::{PacketKind, SendOption};
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::NotConnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Errors surfaced synchronously by connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Send attempted outside the `Connected` state.
    #[error("connection is not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Operation not valid in the current state (e.g. connecting twice).
    #[error("operation invalid in state {0}")]
    InvalidState(ConnectionState),

    #[error("connect did not complete within {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),

    #[error("message of {len} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    /// The connection was closed while the operation was pending.
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally.
    Local,
    /// The peer disconnected or severed the channel.
    Remote,
    /// The peer stayed silent longer than the disconnect timeout.
    Timeout,
    /// Unrecoverable transport error.
    Error(String),
}

impl DisconnectReason {
    /// The failure cause, if the teardown was not requested by either side.
    pub fn error(&self) -> Option<&str> {
        match self {
            DisconnectReason::Error(cause) => Some(cause.as_str()),
            DisconnectReason::Timeout => Some("peer timed out"),
            DisconnectReason::Local | DisconnectReason::Remote => None,
        }
    }
}

/// Silence after which a connection is closed with [`DisconnectReason::Timeout`].
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection tunables, resolved from [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// `None` disables keepalives.
    pub keep_alive_interval: Option<Duration>,
    pub handshake_resend_interval: Duration,
    /// `None` disables liveness detection. Only checked on keepalive ticks.
    pub disconnect_timeout: Option<Duration>,
    /// Serialize observer invocations per connection.
    pub ordered_delivery: bool,
    pub max_datagram_size: usize,
    pub ciphers: CipherFactory,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            handshake_resend_interval: Duration::from_millis(500),
            disconnect_timeout: Some(DEFAULT_DISCONNECT_TIMEOUT),
            ordered_delivery: true,
            max_datagram_size: 65_507,
            ciphers: CipherFactory::default(),
        }
    }
}

impl From<&ConnectionConfig> for ConnectionOptions {
    fn from(config: &ConnectionConfig) -> Self {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            keep_alive_interval: millis(config.keep_alive_interval_ms),
            handshake_resend_interval: Duration::from_millis(config.handshake_resend_interval_ms),
            disconnect_timeout: millis(config.disconnect_timeout_ms),
            ordered_delivery: config.ordered_delivery,
            max_datagram_size: config.max_datagram_size,
            ciphers: CipherFactory::default(),
        }
    }
}

enum InboundEvent {
    Data(DataReceived),
    Disconnected(Disconnected),
    /// Teardown of a connection that never connected.
    Stop,
}

/// Moves events off socket tasks onto a per-connection dispatcher task.
struct InboundDispatcher {
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl InboundDispatcher {
    fn spawn(
        data_received: Arc<Observers<DataReceived>>,
        disconnected: Arc<Observers<Disconnected>>,
        ordered: bool,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            while let Some(event) = rx.recv().await {
                while in_flight.try_join_next().is_some() {}
                match event {
                    InboundEvent::Data(message) if ordered => {
                        data_received.emit(&message);
                    }
                    InboundEvent::Data(message) => {
                        let observers = Arc::clone(&data_received);
                        in_flight.spawn(async move {
                            observers.emit(&message);
                        });
                    }
                    InboundEvent::Disconnected(event) => {
                        while in_flight.join_next().await.is_some() {}
                        disconnected.emit(&event);
                        break;
                    }
                    InboundEvent::Stop => break,
                }
            }
            while in_flight.join_next().await.is_some() {}
            // Handlers often capture their connection; dropping them breaks
            // the cycle once no further event can be raised.
            data_received.clear();
            disconnected.clear();
        });
        Self { tx }
    }

    fn send(&self, event: InboundEvent) {
        // The dispatcher only stops after a terminal event.
        let _ = self.tx.send(event);
    }
}

/// Transport-independent state shared by every connection implementation.
pub struct ConnectionCore {
    id: ConnectionId,
    endpoint: ConnectionEndpoint,
    options: ConnectionOptions,
    /// Lock-free reads; writes go through `transition`.
    state: AtomicU8,
    state_tx: watch::Sender<ConnectionState>,
    transition: Mutex<()>,
    disposed: AtomicBool,
    statistics: ConnectionStatistics,
    data_received: Arc<Observers<DataReceived>>,
    disconnected: Arc<Observers<Disconnected>>,
    inbound: InboundDispatcher,
    keepalive: KeepaliveTimer,
    last_received: Mutex<Instant>,
}

impl ConnectionCore {
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: ConnectionEndpoint, options: ConnectionOptions) -> Self {
        let data_received = Arc::new(Observers::new());
        let disconnected = Arc::new(Observers::new());
        let inbound = InboundDispatcher::spawn(
            Arc::clone(&data_received),
            Arc::clone(&disconnected),
            options.ordered_delivery,
        );
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            id: ConnectionId::new(),
            endpoint,
            keepalive: KeepaliveTimer::new(options.keep_alive_interval),
            options,
            state: AtomicU8::new(ConnectionState::NotConnected as u8),
            state_tx,
            transition: Mutex::new(()),
            disposed: AtomicBool::new(false),
            statistics: ConnectionStatistics::new(),
            data_received,
            disconnected,
            inbound,
            last_received: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &ConnectionEndpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn statistics(&self) -> &ConnectionStatistics {
        &self.statistics
    }

    pub fn keepalive(&self) -> &KeepaliveTimer {
        &self.keepalive
    }

    pub fn data_received(&self) -> &Observers<DataReceived> {
        &self.data_received
    }

    pub fn disconnected(&self) -> &Observers<Disconnected> {
        &self.disconnected
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether teardown has started.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn store_state(&self, next: ConnectionState) {
        self.state.store(next as u8, Ordering::Release);
        self.state_tx.send_replace(next);
        tracing::trace!(connection_id = %self.id, state = %next, "State changed");
    }

    pub fn set_state(&self, next: ConnectionState) {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.store_state(next);
    }

    /// Move to `next` only if the current state is `expected`.
    pub fn compare_and_set(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != expected || self.is_disposed() {
            return false;
        }
        self.store_state(next);
        true
    }

    /// Wait until the connection is `Connected`.
    ///
    /// Fails with `Closed` once teardown starts and with `ConnectTimeout`
    /// when `timeout` elapses first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut rx = self.state_tx.subscribe();
        let ready = async {
            rx.wait_for(|state| *state == ConnectionState::Connected || self.is_disposed())
                .await
                .is_ok_and(|state| *state == ConnectionState::Connected)
        };
        let outcome = time::timeout(timeout, ready).await;
        match outcome {
            Ok(true) if !self.is_disposed() => Ok(()),
            Ok(_) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::ConnectTimeout(timeout)),
        }
    }

    /// Complete the handshake: `Connecting` → `Connected`, then start the
    /// keepalive timer against `target`. Returns false if the connection
    /// was not connecting.
    pub fn establish(&self, target: Weak<dyn Connection>) -> bool {
        if !self.compare_and_set(ConnectionState::Connecting, ConnectionState::Connected) {
            return false;
        }
        self.mark_received();
        self.keepalive.start(target);
        metrics::record_connection_opened();
        tracing::info!(
            connection_id = %self.id,
            endpoint = %self.endpoint,
            "Connection established"
        );
        true
    }

    /// Start teardown. Returns the state the connection was in, or `None`
    /// if teardown already started.
    pub fn begin_close(&self) -> Option<ConnectionState> {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let previous = self.state();
        self.store_state(ConnectionState::Disconnecting);
        Some(previous)
    }

    /// Finish teardown started by [`Self::begin_close`].
    ///
    /// Raises the disconnection event if the connection had been connected.
    pub fn finish_close(&self, previous: ConnectionState, reason: DisconnectReason) {
        self.set_state(ConnectionState::NotConnected);
        if previous == ConnectionState::Connected {
            metrics::record_connection_closed();
            tracing::info!(
                connection_id = %self.id,
                endpoint = %self.endpoint,
                reason = ?reason,
                "Connection closed"
            );
            self.inbound
                .send(InboundEvent::Disconnected(Disconnected { reason }));
        } else {
            tracing::debug!(
                connection_id = %self.id,
                endpoint = %self.endpoint,
                previous = %previous,
                "Connection torn down before it was established"
            );
            self.inbound.send(InboundEvent::Stop);
        }
    }

    /// Queue an inbound message for the observers.
    pub fn deliver(&self, bytes: Vec<u8>, send_option: SendOption) {
        self.inbound
            .send(InboundEvent::Data(DataReceived { bytes, send_option }));
    }

    /// Account for an inbound message and hand data messages to observers.
    ///
    /// Data arriving outside `Connected` is counted but dropped.
    pub fn receive_message(&self, option: SendOption, payload: &[u8], wire_len: usize) {
        self.statistics.log_received(option, payload.len(), wire_len);
        if !option.is_data() {
            return;
        }
        if self.state() == ConnectionState::Connected {
            self.deliver(payload.to_vec(), option);
        } else {
            tracing::trace!(
                connection_id = %self.id,
                state = %self.state(),
                "Dropping message received outside Connected state"
            );
        }
    }

    pub fn mark_received(&self) {
        *self.last_received.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn silence(&self) -> Duration {
        self.last_received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Whether the peer has been silent past the disconnect timeout.
    pub fn peer_timed_out(&self) -> bool {
        self.options
            .disconnect_timeout
            .is_some_and(|limit| self.silence() > limit)
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A message channel to exactly one remote endpoint.
///
/// Implemented independently by each transport; shared lifecycle logic
/// lives in [`ConnectionCore`].
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn core(&self) -> &ConnectionCore;

    /// Establish the channel, sending `handshake` to the peer.
    ///
    /// Blocks until the peer acknowledges or `timeout` elapses.
    async fn connect(&self, handshake: &[u8], timeout: Duration) -> Result<(), ConnectionError>;

    /// Put one frame on the wire. Returns the number of bytes written.
    ///
    /// Transport hook: does not check the connection state.
    async fn write_frame(&self, kind: PacketKind, payload: &[u8]) -> Result<usize, ConnectionError>;

    /// Tear the connection down. Idempotent.
    async fn close_with(&self, reason: DisconnectReason);

    async fn close(&self) {
        self.close_with(DisconnectReason::Local).await
    }

    /// Send a message. Only valid while `Connected`.
    async fn send(&self, bytes: &[u8], option: SendOption) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state));
        }
        let written = self.write_frame(option.into(), bytes).await?;
        self.statistics().log_sent(option, bytes.len(), written);
        Ok(())
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectionError> {
        self.core().wait_connected(timeout).await
    }

    fn state(&self) -> ConnectionState {
        self.core().state()
    }

    fn endpoint(&self) -> &ConnectionEndpoint {
        self.core().endpoint()
    }

    fn statistics(&self) -> &ConnectionStatistics {
        self.core().statistics()
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        self.core().keepalive().interval()
    }

    /// `None` disables keepalives. Restarts the period without firing.
    fn set_keep_alive_interval(&self, interval: Option<Duration>) {
        self.core().keepalive().set_interval(interval)
    }

    /// Cipher factory injected through this connection's options.
    fn ciphers(&self) -> &CipherFactory {
        &self.core().options().ciphers
    }

    fn on_data_received(&self) -> &Observers<DataReceived> {
        self.core().data_received()
    }

    fn on_disconnected(&self) -> &Observers<Disconnected> {
        self.core().disconnected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ConnectionEndpoint {
        ConnectionEndpoint::from_addr("127.0.0.1:9".parse().unwrap())
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnectionState::NotConnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
        ] {
            assert_eq!(ConnectionState::from(state as u8), state);
        }
    }

    #[test]
    fn options_from_config_treat_zero_as_disabled() {
        let config = ConnectionConfig {
            keep_alive_interval_ms: 0,
            disconnect_timeout_ms: 0,
            ..ConnectionConfig::default()
        };
        let options = ConnectionOptions::from(&config);
        assert_eq!(options.keep_alive_interval, None);
        assert_eq!(options.disconnect_timeout, None);
    }

    #[test]
    fn defaults_close_silent_peers() {
        let options = ConnectionOptions::default();
        assert_eq!(options.disconnect_timeout, Some(DEFAULT_DISCONNECT_TIMEOUT));
        assert!(options.keep_alive_interval < options.disconnect_timeout);

        let from_config = ConnectionOptions::from(&ConnectionConfig::default());
        assert_eq!(from_config.disconnect_timeout, options.disconnect_timeout);
        assert_eq!(from_config.keep_alive_interval, options.keep_alive_interval);
    }

    #[tokio::test]
    async fn wait_connected_released_by_transition() {
        let core = Arc::new(ConnectionCore::new(endpoint(), ConnectionOptions::default()));
        assert!(core.compare_and_set(ConnectionState::NotConnected, ConnectionState::Connecting));

        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_connected(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        core.set_state(ConnectionState::Connected);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_connected_times_out() {
        let core = ConnectionCore::new(endpoint(), ConnectionOptions::default());
        let result = core.wait_connected(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(ConnectionError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn close_unblocks_waiters() {
        let core = Arc::new(ConnectionCore::new(endpoint(), ConnectionOptions::default()));
        core.set_state(ConnectionState::Connecting);

        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.wait_connected(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let previous = core.begin_close().unwrap();
        core.finish_close(previous, DisconnectReason::Local);

        assert!(matches!(waiter.await.unwrap(), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let core = ConnectionCore::new(endpoint(), ConnectionOptions::default());
        core.set_state(ConnectionState::Connected);

        assert_eq!(core.begin_close(), Some(ConnectionState::Connected));
        assert_eq!(core.begin_close(), None);
        assert!(!core.compare_and_set(ConnectionState::Disconnecting, ConnectionState::Connected));
    }

    #[tokio::test]
    async fn ordered_delivery_preserves_sequence() {
        let core = ConnectionCore::new(endpoint(), ConnectionOptions::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        core.data_received().subscribe(move |message: &DataReceived| {
            let _ = tx.send(message.bytes[0]);
        });

        for i in 0..50u8 {
            core.deliver(vec![i], SendOption::Reliable);
        }

        for expected in 0..50u8 {
            let got = time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
            assert_eq!(got, Some(expected));
        }
    }

    #[tokio::test]
    async fn disconnect_event_follows_queued_messages() {
        let core = ConnectionCore::new(endpoint(), ConnectionOptions::default());
        core.set_state(ConnectionState::Connected);
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        let data_tx = tx.clone();
        core.data_received().subscribe(move |_| {
            let _ = data_tx.send("data");
        });
        core.disconnected().subscribe(move |_| {
            let _ = tx.send("disconnected");
        });

        core.deliver(vec![1], SendOption::None);
        let previous = core.begin_close().unwrap();
        core.finish_close(previous, DisconnectReason::Remote);

        assert_eq!(rx.recv().await, Some("data"));
        assert_eq!(rx.recv().await, Some("disconnected"));
    }

    #[tokio::test]
    async fn unordered_delivery_completes_before_disconnect() {
        let options = ConnectionOptions {
            ordered_delivery: false,
            ..ConnectionOptions::default()
        };
        let core = ConnectionCore::new(endpoint(), options);
        core.set_state(ConnectionState::Connected);
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<u8>>();
        let data_tx = tx.clone();
        core.data_received().subscribe(move |message: &DataReceived| {
            let _ = data_tx.send(Some(message.bytes[0]));
        });
        core.disconnected().subscribe(move |_| {
            let _ = tx.send(None);
        });

        for i in 0..50u8 {
            core.deliver(vec![i], SendOption::None);
        }
        let previous = core.begin_close().unwrap();
        core.finish_close(previous, DisconnectReason::Remote);

        let mut seen = Vec::new();
        while let Some(Some(byte)) = rx.recv().await {
            seen.push(byte);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..50u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn teardown_before_connect_releases_handlers() {
        let core = ConnectionCore::new(endpoint(), ConnectionOptions::default());
        core.set_state(ConnectionState::Connecting);
        let captured = Arc::new(());
        let held = Arc::clone(&captured);
        core.data_received().subscribe(move |_| {
            let _ = Arc::strong_count(&held);
        });
        core.disconnected().subscribe(|_| {});

        let previous = core.begin_close().unwrap();
        core.finish_close(previous, DisconnectReason::Timeout);

        let released = time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&captured) > 1 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(released.is_ok());
        assert!(core.data_received().is_empty());
        assert!(core.disconnected().is_empty());
    }

    #[tokio::test]
    async fn handlers_are_released_after_disconnect_event() {
        let core = ConnectionCore::new(endpoint(), ConnectionOptions::default());
        core.set_state(ConnectionState::Connected);
        let (tx, mut rx) = mpsc::unbounded_channel();
        core.disconnected().subscribe(move |event: &Disconnected| {
            let _ = tx.send(event.reason.clone());
        });

        let previous = core.begin_close().unwrap();
        core.finish_close(previous, DisconnectReason::Local);

        assert_eq!(rx.recv().await, Some(DisconnectReason::Local));
        // The sender lived in the handler; the channel closes once it is dropped.
        assert_eq!(rx.recv().await, None);
    }
}
