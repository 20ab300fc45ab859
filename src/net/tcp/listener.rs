//! Stream listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured endpoint in its IP mode
//! - Accept streams, holding a connection slot for each
//! - Read the Hello frame within the handshake timeout
//! - Raise a new-connection event carrying the handshake bytes

use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;

use super::connection::TcpConnection;
use super::{read_frame, LENGTH_PREFIX};
use crate::net::connection::{Connection, ConnectionOptions};
use crate::net::endpoint::{ConnectionEndpoint, IpMode};
use crate::net::event::NewConnection;
use crate::net::listener::{ConnectionListener, ConnectionPermit, ListenerBase, ListenerError};
use crate::net::wire;
use crate::observability::metrics;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

pub struct TcpConnectionListener {
    base: ListenerBase<TcpConnection>,
    handshake_timeout: Duration,
    connections: DashMap<SocketAddr, Arc<TcpConnection>>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    weak_self: Weak<TcpConnectionListener>,
}

impl TcpConnectionListener {
    pub fn new(endpoint: ConnectionEndpoint) -> Arc<Self> {
        Self::with_options(
            endpoint,
            ConnectionOptions::default(),
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_HANDSHAKE_TIMEOUT,
        )
    }

    pub fn with_options(
        endpoint: ConnectionEndpoint,
        options: ConnectionOptions,
        max_connections: usize,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            base: ListenerBase::new(endpoint, options, max_connections),
            handshake_timeout,
            connections: DashMap::new(),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn remove_connection(&self, addr: &SocketAddr) -> bool {
        let removed = self.connections.remove(addr).is_some();
        if removed {
            tracing::debug!(peer = %addr, "Stream connection removed");
        }
        removed
    }

    pub fn connection(&self, addr: &SocketAddr) -> Option<Arc<TcpConnection>> {
        self.connections.get(addr).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Read the peer's Hello and promote the stream to a connection.
    async fn handshake(&self, mut stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let options = self.base.connection_options();
        let hello = time::timeout(
            self.handshake_timeout,
            read_frame(&mut stream, options.max_datagram_size),
        )
        .await;
        let frame = match hello {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::debug!(peer = %peer, "Stream closed before handshake");
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "Handshake read failed");
                return;
            }
            Err(_) => {
                tracing::debug!(
                    peer = %peer,
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "Handshake timed out"
                );
                metrics::record_handshake_rejected("timeout");
                return;
            }
        };
        if frame.first() != Some(&wire::HELLO) {
            tracing::debug!(peer = %peer, "First frame was not a Hello, dropping stream");
            metrics::record_handshake_rejected("not_hello");
            return;
        }
        if self.is_disposed() {
            return;
        }

        let endpoint = ConnectionEndpoint::new(peer, self.base.endpoint().ip_mode());
        let (connection, read_half) =
            TcpConnection::accepted(stream, endpoint, options, self.weak_self.clone(), permit);
        connection
            .core()
            .statistics()
            .log_hello_received(frame.len() + LENGTH_PREFIX);
        // Registered before the reader runs, so a close always finds its entry.
        self.connections.insert(peer, Arc::clone(&connection));
        if !connection.establish() {
            self.remove_connection(&peer);
            return;
        }

        tracing::info!(
            connection_id = %connection.core().id(),
            peer = %peer,
            handshake_len = frame.len() - 1,
            "New stream connection"
        );
        // Observers subscribe before the peer learns it may send data.
        self.base.raise_new_connection(NewConnection {
            handshake: frame[1..].to_vec(),
            connection: Arc::clone(&connection),
        });
        connection.acknowledge().await;
        connection.start_reading(read_half);
    }
}

impl ConnectionListener for TcpConnectionListener {
    type Connection = TcpConnection;

    fn base(&self) -> &ListenerBase<TcpConnection> {
        &self.base
    }

    fn start(&self) -> Result<(), ListenerError> {
        let mut acceptor = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            return Err(ListenerError::Disposed);
        }
        if acceptor.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }

        let endpoint = self.base.endpoint();
        let listener = bind(endpoint.addr(), endpoint.ip_mode()).map_err(|source| {
            ListenerError::BindFailed {
                addr: endpoint.addr(),
                source,
            }
        })?;
        let local_addr = listener.local_addr().ok();
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = local_addr;

        tracing::info!(
            address = ?local_addr,
            ip_mode = %endpoint.ip_mode(),
            max_connections = self.base.limit().max_connections(),
            "Stream listener started"
        );

        *acceptor = Some(tokio::spawn(accept_loop(self.weak_self.clone(), listener)));
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!(
            endpoint = %self.base.endpoint(),
            connections = self.connections.len(),
            "Stream listener disposed"
        );
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> Vec<Arc<TcpConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Drop for TcpConnectionListener {
    fn drop(&mut self) {
        if let Some(task) = self.acceptor.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TcpConnectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectionListener")
            .field("base", &self.base)
            .field("connections", &self.connections.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Bind a listening stream socket for `mode`.
fn bind(addr: SocketAddr, mode: IpMode) -> io::Result<TcpListener> {
    if !mode.accepts(&addr) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address {addr} does not match ip mode {mode}"),
        ));
    }
    let domain = match mode {
        IpMode::IPv4 => Domain::IPV4,
        IpMode::IPv6 | IpMode::Dual => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(mode == IpMode::IPv6)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&mode.normalize(addr).into())?;
    socket.listen(ACCEPT_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(owner: Weak<TcpConnectionListener>, listener: TcpListener) {
    loop {
        // Take a slot first so a full listener stops accepting.
        let limit = match owner.upgrade() {
            Some(owner) => owner.base.limit().clone(),
            None => break,
        };
        let Some(permit) = limit.acquire().await else { break };

        let accepted = listener.accept().await;
        let Some(owner) = owner.upgrade() else { break };
        if owner.is_disposed() {
            break;
        }
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(
                    peer = %peer,
                    available_slots = owner.base.limit().available(),
                    "Stream accepted"
                );
                tokio::spawn(async move {
                    owner.handshake(stream, peer, permit).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept stream");
                drop(owner);
                time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
    tracing::debug!("Stream accept loop stopped");
}
