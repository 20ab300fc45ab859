//! Stream connections.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::listener::TcpConnectionListener;
use super::{encode_frame, read_frame, LENGTH_PREFIX};
use crate::net::connection::{
    Connection, ConnectionCore, ConnectionError, ConnectionOptions, ConnectionState,
    DisconnectReason,
};
use crate::net::endpoint::ConnectionEndpoint;
use crate::net::listener::ConnectionPermit;
use crate::net::wire::PacketKind;

/// Link back to the listener that accepted this connection.
struct Accepted {
    listener: Weak<TcpConnectionListener>,
    permit: Mutex<Option<ConnectionPermit>>,
}

pub struct TcpConnection {
    core: ConnectionCore,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    refusal: Mutex<Option<String>>,
    accepted: Option<Accepted>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    /// A client connection towards `endpoint` with default options.
    pub fn new(endpoint: ConnectionEndpoint) -> Arc<Self> {
        Self::with_options(endpoint, ConnectionOptions::default())
    }

    pub fn with_options(endpoint: ConnectionEndpoint, options: ConnectionOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            core: ConnectionCore::new(endpoint, options),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            local_addr: Mutex::new(None),
            refusal: Mutex::new(None),
            accepted: None,
            weak_self: weak.clone(),
        })
    }

    /// Wrap a stream whose Hello frame the listener has already read.
    ///
    /// The read half is handed back; nothing is read from the peer until
    /// [`start_reading`](Self::start_reading) is called.
    pub(crate) fn accepted(
        stream: TcpStream,
        endpoint: ConnectionEndpoint,
        options: ConnectionOptions,
        listener: Weak<TcpConnectionListener>,
        permit: ConnectionPermit,
    ) -> (Arc<Self>, OwnedReadHalf) {
        let local_addr = stream.local_addr().ok();
        let (read_half, write_half) = split(stream);
        let connection = Arc::new_cyclic(|weak| Self {
            core: ConnectionCore::new(endpoint, options),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader: Mutex::new(None),
            local_addr: Mutex::new(local_addr),
            refusal: Mutex::new(None),
            accepted: Some(Accepted {
                listener,
                permit: Mutex::new(Some(permit)),
            }),
            weak_self: weak.clone(),
        });
        connection.core.set_state(ConnectionState::Connecting);
        (connection, read_half)
    }

    /// Spawn the reader for an accepted stream.
    pub(crate) fn start_reading(&self, read_half: OwnedReadHalf) {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if self.core.is_disposed() {
            return;
        }
        *reader = Some(tokio::spawn(read_loop(
            self.weak_self.clone(),
            read_half,
            self.core.options().max_datagram_size,
        )));
    }

    pub fn is_passive(&self) -> bool {
        self.accepted.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move an accepted stream to `Connected`. False if it was not connecting.
    pub(crate) fn establish(&self) -> bool {
        self.core.establish(self.target())
    }

    /// Answer the peer's Hello.
    pub(crate) async fn acknowledge(&self) {
        match self.write_frame(PacketKind::Acknowledgement, &[]).await {
            Ok(written) => self.core.statistics().log_control_sent(written),
            Err(e) => tracing::debug!(
                connection_id = %self.core.id(),
                error = %e,
                "Handshake acknowledgement not sent"
            ),
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

    async fn attach(&self, stream: TcpStream) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = stream.local_addr().ok();
        let (read_half, write_half) = split(stream);
        *self.writer.lock().await = Some(write_half);
        self.start_reading(read_half);
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let Some((&discriminator, payload)) = frame.split_first() else {
            return;
        };
        self.core.mark_received();
        let statistics = self.core.statistics();
        let wire_len = frame.len() + LENGTH_PREFIX;

        match PacketKind::try_from(discriminator) {
            // The handshake happens once per stream; repeats are ignored.
            Ok(PacketKind::Hello) => statistics.log_hello_received(wire_len),
            Ok(PacketKind::Acknowledgement) => {
                statistics.log_control_received(wire_len);
                if !self.is_passive() {
                    self.core.establish(self.target());
                }
            }
            Ok(PacketKind::Disconnect) => {
                statistics.log_control_received(wire_len);
                if self.state() == ConnectionState::Connecting {
                    self.set_refusal("peer rejected the handshake".to_string());
                }
                self.close_with(DisconnectReason::Remote).await;
            }
            Ok(kind) => {
                if let Some(option) = kind.send_option() {
                    self.core.receive_message(option, payload, wire_len);
                }
            }
            Err(unknown) => {
                tracing::trace!(
                    connection_id = %self.core.id(),
                    discriminator = unknown,
                    "Dropping frame with reserved discriminator"
                );
            }
        }
    }

    async fn fail_connect(&self, reason: DisconnectReason, error: ConnectionError) -> ConnectionError {
        self.close_with(reason).await;
        error
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    async fn connect(&self, handshake: &[u8], timeout: Duration) -> Result<(), ConnectionError> {
        if self.is_passive()
            || !self
                .core
                .compare_and_set(ConnectionState::NotConnected, ConnectionState::Connecting)
        {
            return Err(ConnectionError::InvalidState(self.state()));
        }

        let deadline = Instant::now() + timeout;
        let endpoint = *self.core.endpoint();
        tracing::debug!(
            connection_id = %self.core.id(),
            endpoint = %endpoint,
            handshake_len = handshake.len(),
            "Connecting"
        );

        let stream = match time::timeout(timeout, TcpStream::connect(endpoint.socket_addr())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let reason = DisconnectReason::Error(e.to_string());
                let error = if e.kind() == io::ErrorKind::ConnectionRefused {
                    ConnectionError::ConnectRefused(e.to_string())
                } else {
                    ConnectionError::Io(e)
                };
                return Err(self.fail_connect(reason, error).await);
            }
            Err(_) => {
                return Err(self
                    .fail_connect(DisconnectReason::Timeout, ConnectionError::ConnectTimeout(timeout))
                    .await);
            }
        };
        self.attach(stream).await;

        match self.write_frame(PacketKind::Hello, handshake).await {
            Ok(written) => self.core.statistics().log_hello_sent(written),
            Err(e) => {
                let reason = DisconnectReason::Error(e.to_string());
                return Err(self.fail_connect(reason, e).await);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.core.wait_connected(remaining).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::ConnectTimeout(_)) => Err(self
                .fail_connect(DisconnectReason::Timeout, ConnectionError::ConnectTimeout(timeout))
                .await),
            Err(_) => Err(self
                .take_refusal()
                .map(ConnectionError::ConnectRefused)
                .unwrap_or(ConnectionError::Closed)),
        }
    }

    async fn write_frame(&self, kind: PacketKind, payload: &[u8]) -> Result<usize, ConnectionError> {
        let max = self.core.options().max_datagram_size;
        if payload.len() + 1 > max {
            return Err(ConnectionError::MessageTooLarge {
                len: payload.len() + 1,
                max,
            });
        }
        let frame = encode_frame(kind, payload);
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ConnectionError::Closed)?;
        writer
            .write_all(&frame)
            .await
            .map_err(ConnectionError::SendFailed)?;
        Ok(frame.len())
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

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(accepted) = &self.accepted {
            accepted.permit.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(listener) = accepted.listener.upgrade() {
                listener.remove_connection(&self.core.endpoint().addr());
            }
        }
        // May be running on the reader task: abort only after the last await.
        if let Some(task) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.core.finish_close(previous, reason);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("core", &self.core)
            .field("passive", &self.is_passive())
            .finish()
    }
}

fn split(stream: TcpStream) -> (OwnedReadHalf, OwnedWriteHalf) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    stream.into_split()
}

async fn read_loop(connection: Weak<TcpConnection>, mut reader: OwnedReadHalf, max_frame_len: usize) {
    loop {
        let frame = read_frame(&mut reader, max_frame_len).await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(frame)) => connection.handle_frame(&frame).await,
            Ok(None) => {
                if connection.state() == ConnectionState::Connecting {
                    connection.set_refusal("peer closed the stream during the handshake".to_string());
                }
                connection.close_with(DisconnectReason::Remote).await;
                return;
            }
            Err(e) => {
                if connection.state() == ConnectionState::Connecting {
                    connection.set_refusal(e.to_string());
                }
                connection
                    .close_with(DisconnectReason::Error(e.to_string()))
                    .await;
                return;
            }
        }
    }
}
