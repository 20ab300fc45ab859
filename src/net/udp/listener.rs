//! Datagram listener: one socket, many virtual connections.
//!
//! # Responsibilities
//! - Bind the listening socket in the configured IP mode
//! - Route each datagram to the virtual connection of its source endpoint
//! - Admit unknown endpoints only when their first datagram is a Hello
//! - Raise a new-connection event carrying the handshake bytes
//!
//! The receive loop re-arms after every datagram, including failed or
//! malformed ones, until the listener is disposed.

use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::connection::UdpConnection;
use super::socket;
use crate::net::connection::{Connection, ConnectionOptions};
use crate::net::endpoint::ConnectionEndpoint;
use crate::net::event::NewConnection;
use crate::net::listener::{ConnectionListener, ListenerBase, ListenerError};
use crate::net::wire;
use crate::observability::metrics;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

pub struct UdpConnectionListener {
    base: ListenerBase<UdpConnection>,
    socket: ArcSwapOption<UdpSocket>,
    /// Virtual connection table, keyed by remote endpoint.
    connections: DashMap<SocketAddr, Arc<UdpConnection>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    weak_self: Weak<UdpConnectionListener>,
}

impl UdpConnectionListener {
    pub fn new(endpoint: ConnectionEndpoint) -> Arc<Self> {
        Self::with_options(endpoint, ConnectionOptions::default(), DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_options(
        endpoint: ConnectionEndpoint,
        options: ConnectionOptions,
        max_connections: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: ListenerBase::new(endpoint, options, max_connections),
            socket: ArcSwapOption::empty(),
            connections: DashMap::new(),
            receiver: Mutex::new(None),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Send one datagram from the listening socket. A no-op once disposed.
    pub async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> Result<(), ListenerError> {
        let Some(socket) = self.socket.load_full() else {
            return Ok(());
        };
        socket
            .send_to(datagram, addr)
            .await
            .map(|_| ())
            .map_err(|source| ListenerError::SendFailed { addr, source })
    }

    /// Forget the virtual connection for `addr`. Later datagrams from that
    /// endpoint are treated as coming from an unknown peer.
    pub fn remove_connection(&self, addr: &SocketAddr) -> bool {
        let removed = self.connections.remove(addr).is_some();
        if removed {
            tracing::debug!(peer = %addr, "Virtual connection removed");
        }
        removed
    }

    pub fn connection(&self, addr: &SocketAddr) -> Option<Arc<UdpConnection>> {
        self.connections.get(addr).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    async fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let Some(&discriminator) = datagram.first() else {
            return;
        };

        if let Some(connection) = self.connection(&from) {
            connection.handle_datagram(datagram).await;
            return;
        }

        if discriminator != wire::HELLO {
            tracing::trace!(peer = %from, discriminator, "Dropping datagram from unknown endpoint");
            metrics::record_datagram_dropped("unknown_endpoint");
            return;
        }

        let Some(permit) = self.base.limit().try_acquire() else {
            tracing::warn!(
                peer = %from,
                max_connections = self.base.limit().max_connections(),
                "Connection limit reached, ignoring Hello"
            );
            metrics::record_datagram_dropped("connection_limit");
            return;
        };

        let endpoint = ConnectionEndpoint::new(from, self.base.endpoint().ip_mode());
        let connection = UdpConnection::passive(
            endpoint,
            self.base.connection_options(),
            self.weak_self.clone(),
            permit,
        );
        match self.connections.entry(from) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&connection));
            }
        }

        connection.handle_datagram(datagram).await;
        tracing::info!(
            connection_id = %connection.core().id(),
            peer = %from,
            handshake_len = datagram.len() - 1,
            "New virtual connection"
        );
        self.base.raise_new_connection(NewConnection {
            handshake: datagram[1..].to_vec(),
            connection,
        });
    }
}

impl ConnectionListener for UdpConnectionListener {
    type Connection = UdpConnection;

    fn base(&self) -> &ListenerBase<UdpConnection> {
        &self.base
    }

    fn start(&self) -> Result<(), ListenerError> {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            return Err(ListenerError::Disposed);
        }
        if receiver.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }

        let endpoint = self.base.endpoint();
        let socket = socket::bind(endpoint.addr(), endpoint.ip_mode())
            .map(Arc::new)
            .map_err(|source| ListenerError::BindFailed {
                addr: endpoint.addr(),
                source,
            })?;

        tracing::info!(
            address = ?socket.local_addr().ok(),
            ip_mode = %endpoint.ip_mode(),
            max_connections = self.base.limit().max_connections(),
            "Datagram listener started"
        );

        self.socket.store(Some(Arc::clone(&socket)));
        let max_datagram_size = self.base.connection_options().max_datagram_size;
        *receiver = Some(tokio::spawn(receive_loop(
            self.weak_self.clone(),
            socket,
            max_datagram_size,
        )));
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.socket.store(None);
        if let Some(task) = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        tracing::info!(
            endpoint = %self.base.endpoint(),
            connections = self.connections.len(),
            "Datagram listener disposed"
        );
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.socket
            .load_full()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn connections(&self) -> Vec<Arc<UdpConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Drop for UdpConnectionListener {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for UdpConnectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConnectionListener")
            .field("base", &self.base)
            .field("connections", &self.connections.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

async fn receive_loop(
    listener: Weak<UdpConnectionListener>,
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let received = socket.recv_from(&mut buf).await;
        let Some(listener) = listener.upgrade() else {
            break;
        };
        if listener.is_disposed() {
            break;
        }
        match received {
            Ok((len, from)) => listener.dispatch(&buf[..len], from).await,
            Err(e) => {
                // ICMP errors from one peer must not stop the listener.
                tracing::debug!(error = %e, "Datagram receive failed");
                metrics::record_datagram_dropped("receive_error");
            }
        }
    }
    tracing::debug!("Datagram receive loop stopped");
}
