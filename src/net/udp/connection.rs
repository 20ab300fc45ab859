//! Datagram connections.
//!
//! A [`UdpConnection`] is either a client that owns a socket connected to
//! its peer, or a passive virtual connection created by
//! [`UdpConnectionListener`] that shares the listener's socket.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::listener::UdpConnectionListener;
use super::socket;
use crate::net::connection::{
    Connection, ConnectionCore, ConnectionError, ConnectionOptions, ConnectionState,
    DisconnectReason,
};
use crate::net::endpoint::ConnectionEndpoint;
use crate::net::listener::{ConnectionListener, ConnectionPermit, ListenerError};
use crate::net::wire::{self, PacketKind};

enum DatagramLink {
    /// Own socket, connected to the peer.
    Client {
        socket: ArcSwapOption<UdpSocket>,
        reader: Mutex<Option<JoinHandle<()>>>,
    },
    /// Virtual connection on the listener's shared socket.
    Passive {
        listener: Weak<UdpConnectionListener>,
        permit: Mutex<Option<ConnectionPermit>>,
    },
}

pub struct UdpConnection {
    core: ConnectionCore,
    link: DatagramLink,
    /// Why the peer turned the handshake down, if it did.
    refusal: Mutex<Option<String>>,
    weak_self: Weak<UdpConnection>,
}

impl UdpConnection {
    /// A client connection towards `endpoint` with default options.
    pub fn new(endpoint: ConnectionEndpoint) -> Arc<Self> {
        Self::with_options(endpoint, ConnectionOptions::default())
    }

    pub fn with_options(endpoint: ConnectionEndpoint, options: ConnectionOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: ConnectionCore::new(endpoint, options),
            link: DatagramLink::Client {
                socket: ArcSwapOption::empty(),
                reader: Mutex::new(None),
            },
            refusal: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub(crate) fn passive(
        endpoint: ConnectionEndpoint,
        options: ConnectionOptions,
        listener: Weak<UdpConnectionListener>,
        permit: ConnectionPermit,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|weak| Self {
            core: ConnectionCore::new(endpoint, options),
            link: DatagramLink::Passive {
                listener,
                permit: Mutex::new(Some(permit)),
            },
            refusal: Mutex::new(None),
            weak_self: weak.clone(),
        });
        connection.core.set_state(ConnectionState::Connecting);
        connection
    }

    pub fn is_passive(&self) -> bool {
        matches!(self.link, DatagramLink::Passive { .. })
    }

    /// Local address of the socket carrying this connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            DatagramLink::Client { socket, .. } => socket
                .load_full()
                .and_then(|socket| socket.local_addr().ok()),
            DatagramLink::Passive { listener, .. } => {
                listener.upgrade().and_then(|listener| listener.local_endpoint())
            }
        }
    }

    fn target(&self) -> Weak<dyn Connection> {
        self.weak_self.clone()
    }

    fn set_refusal(&self, reason: String) {
        *self.refusal.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    fn take_refusal(&self) -> Option<String> {
        self.refusal.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Handshake resend period with up to 10% jitter.
    fn resend_interval(&self) -> Duration {
        let base = self.core.options().handshake_resend_interval;
        let jitter_range = base.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    async fn open_socket(&self) -> io::Result<Arc<UdpSocket>> {
        let endpoint = self.core.endpoint();
        let mode = endpoint.ip_mode();
        let socket = socket::bind(mode.unspecified(0), mode)?;
        socket.connect(endpoint.socket_addr()).await?;
        Ok(Arc::new(socket))
    }

    async fn write_datagram(&self, datagram: &[u8]) -> Result<usize, ConnectionError> {
        let max = self.core.options().max_datagram_size;
        if datagram.len() > max {
            return Err(ConnectionError::MessageTooLarge {
                len: datagram.len(),
                max,
            });
        }
        match &self.link {
            DatagramLink::Client { socket, .. } => {
                let socket = socket.load_full().ok_or(ConnectionError::Closed)?;
                socket.send(datagram).await.map_err(ConnectionError::SendFailed)
            }
            DatagramLink::Passive { listener, .. } => {
                // A disposed listener swallows sends.
                let Some(listener) = listener.upgrade() else {
                    return Ok(datagram.len());
                };
                listener
                    .send_to(datagram, self.core.endpoint().addr())
                    .await
                    .map_err(|e| match e {
                        ListenerError::SendFailed { source, .. } => {
                            ConnectionError::SendFailed(source)
                        }
                        _ => ConnectionError::Closed,
                    })?;
                Ok(datagram.len())
            }
        }
    }

    async fn acknowledge(&self) {
        match self.write_frame(PacketKind::Acknowledgement, &[]).await {
            Ok(written) => self.core.statistics().log_control_sent(written),
            Err(e) => tracing::debug!(
                connection_id = %self.core.id(),
                error = %e,
                "Handshake acknowledgement not sent"
            ),
        }
    }

    /// Process one datagram from the peer.
    pub(crate) async fn handle_datagram(&self, datagram: &[u8]) {
        let Some((&discriminator, payload)) = datagram.split_first() else {
            return;
        };
        self.core.mark_received();
        let statistics = self.core.statistics();

        match PacketKind::try_from(discriminator) {
            Ok(PacketKind::Hello) => {
                statistics.log_hello_received(datagram.len());
                if self.is_passive() && !self.core.is_disposed() {
                    self.core.establish(self.target());
                    // Duplicates are retransmissions: acknowledge them again.
                    self.acknowledge().await;
                }
            }
            Ok(PacketKind::Acknowledgement) => {
                statistics.log_control_received(datagram.len());
                if !self.is_passive() {
                    self.core.establish(self.target());
                }
            }
            Ok(PacketKind::Disconnect) => {
                statistics.log_control_received(datagram.len());
                if self.state() == ConnectionState::Connecting {
                    self.set_refusal("peer rejected the handshake".to_string());
                }
                self.close_with(DisconnectReason::Remote).await;
            }
            Ok(kind) => {
                if let Some(option) = kind.send_option() {
                    self.core.receive_message(option, payload, datagram.len());
                }
            }
            Err(unknown) => {
                tracing::trace!(
                    connection_id = %self.core.id(),
                    discriminator = unknown,
                    "Dropping datagram with reserved discriminator"
                );
            }
        }
    }

    /// Release the transport. Runs last in teardown because it may abort
    /// the task that is executing it.
    fn release(&self) {
        match &self.link {
            DatagramLink::Client { socket, reader } => {
                socket.store(None);
                if let Some(task) = reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    task.abort();
                }
            }
            DatagramLink::Passive { listener, permit } => {
                permit.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(listener) = listener.upgrade() {
                    listener.remove_connection(&self.core.endpoint().addr());
                }
            }
        }
    }
}

#[async_trait]
impl Connection for UdpConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    async fn connect(&self, handshake: &[u8], timeout: Duration) -> Result<(), ConnectionError> {
        let DatagramLink::Client { socket: slot, reader } = &self.link else {
            return Err(ConnectionError::InvalidState(self.state()));
        };
        if !self
            .core
            .compare_and_set(ConnectionState::NotConnected, ConnectionState::Connecting)
        {
            return Err(ConnectionError::InvalidState(self.state()));
        }

        let socket = match self.open_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                self.close_with(DisconnectReason::Error(e.to_string())).await;
                return Err(ConnectionError::Io(e));
            }
        };
        slot.store(Some(Arc::clone(&socket)));
        let task = tokio::spawn(read_loop(
            self.weak_self.clone(),
            socket,
            self.core.options().max_datagram_size,
        ));
        *reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::debug!(
            connection_id = %self.core.id(),
            endpoint = %self.core.endpoint(),
            handshake_len = handshake.len(),
            "Connecting"
        );

        let hello = wire::frame(PacketKind::Hello, handshake);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.write_datagram(&hello).await {
                Ok(written) => self.core.statistics().log_hello_sent(written),
                Err(e) => {
                    self.close_with(DisconnectReason::Error(e.to_string())).await;
                    return Err(e);
                }
            }
            match self
                .core
                .wait_connected(remaining.min(self.resend_interval()))
                .await
            {
                Ok(()) => return Ok(()),
                Err(ConnectionError::ConnectTimeout(_)) => continue,
                Err(_) => {
                    return Err(self
                        .take_refusal()
                        .map(ConnectionError::ConnectRefused)
                        .unwrap_or(ConnectionError::Closed));
                }
            }
        }

        tracing::debug!(
            connection_id = %self.core.id(),
            endpoint = %self.core.endpoint(),
            "Handshake timed out"
        );
        self.close_with(DisconnectReason::Timeout).await;
        Err(ConnectionError::ConnectTimeout(timeout))
    }

    async fn write_frame(&self, kind: PacketKind, payload: &[u8]) -> Result<usize, ConnectionError> {
        self.write_datagram(&wire::frame(kind, payload)).await
    }

    async fn close_with(&self, reason: DisconnectReason) {
        let Some(previous) = self.core.begin_close() else {
            return;
        };
        self.core.keepalive().dispose().await;

        if previous == ConnectionState::Connected && reason != DisconnectReason::Remote {
            match self.write_frame(PacketKind::Disconnect, &[]).await {
                Ok(written) => self.core.statistics().log_control_sent(written),
                Err(e) => tracing::debug!(
                    connection_id = %self.core.id(),
                    error = %e,
                    "Disconnect notice not sent"
                ),
            }
        }

        self.release();
        self.core.finish_close(previous, reason);
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        if let DatagramLink::Client { reader, .. } = &mut self.link {
            if let Some(task) = reader.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConnection")
            .field("core", &self.core)
            .field("passive", &self.is_passive())
            .finish()
    }
}

fn peer_gone(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Receive loop of a client connection's own socket.
async fn read_loop(connection: Weak<UdpConnection>, socket: Arc<UdpSocket>, max_datagram_size: usize) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let received = socket.recv(&mut buf).await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match received {
            Ok(len) => connection.handle_datagram(&buf[..len]).await,
            Err(e) if peer_gone(&e) => {
                if connection.state() == ConnectionState::Connecting {
                    connection.set_refusal(e.to_string());
                }
                connection
                    .close_with(DisconnectReason::Error(e.to_string()))
                    .await;
                return;
            }
            Err(e) => {
                tracing::debug!(
                    connection_id = %connection.core().id(),
                    error = %e,
                    "Datagram receive failed"
                );
            }
        }
    }
}
