//! Listener plumbing shared by the datagram and stream listeners.
//!
//! # Responsibilities
//! - Hold the configured endpoint and IP mode
//! - Raise "new connection" events to observers
//! - Enforce `max_connections` via a semaphore
//! - Hold the connection options handed to passive connections

use arc_swap::ArcSwap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::net::connection::{Connection, ConnectionOptions};
use crate::net::endpoint::ConnectionEndpoint;
use crate::net::event::{NewConnection, Observers};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The OS rejected the bind (address in use, permission, family).
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to send to {addr}: {source}")]
    SendFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener already started")]
    AlreadyStarted,

    #[error("listener disposed")]
    Disposed,
}

/// A bounded pool of connection slots.
///
/// When the limit is reached, datagram peers are turned away and stream
/// accepts wait until a slot is released.
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionLimit {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Take a slot without waiting. `None` when the listener is full.
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionPermit { _permit: permit })
    }

    /// Wait for a slot. `None` only if the pool was closed.
    pub async fn acquire(&self) -> Option<ConnectionPermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| ConnectionPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// Held by the connection for its lifetime; dropping it releases the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// State and event plumbing common to every listener.
pub struct ListenerBase<C: ?Sized> {
    endpoint: ConnectionEndpoint,
    new_connection: Observers<NewConnection<C>>,
    options: ArcSwap<ConnectionOptions>,
    limit: ConnectionLimit,
}

impl<C: ?Sized> ListenerBase<C> {
    pub fn new(endpoint: ConnectionEndpoint, options: ConnectionOptions, max_connections: usize) -> Self {
        Self {
            endpoint,
            new_connection: Observers::new(),
            options: ArcSwap::from_pointee(options),
            limit: ConnectionLimit::new(max_connections),
        }
    }

    pub fn endpoint(&self) -> &ConnectionEndpoint {
        &self.endpoint
    }

    pub fn on_new_connection(&self) -> &Observers<NewConnection<C>> {
        &self.new_connection
    }

    pub fn raise_new_connection(&self, event: NewConnection<C>) {
        self.new_connection.emit(&event);
    }

    /// Options for the next passive connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::clone(&self.options.load())
    }

    /// Replace the options used for connections created from now on.
    pub fn set_connection_options(&self, options: ConnectionOptions) {
        self.options.store(Arc::new(options));
    }

    pub fn limit(&self) -> &ConnectionLimit {
        &self.limit
    }
}

impl<C: ?Sized> std::fmt::Debug for ListenerBase<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBase")
            .field("endpoint", &self.endpoint)
            .field("observers", &self.new_connection.len())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Capability interface of a listener, independent of transport.
pub trait ConnectionListener: Send + Sync {
    type Connection: Connection;

    fn base(&self) -> &ListenerBase<Self::Connection>;

    /// Bind and begin accepting peers.
    fn start(&self) -> Result<(), ListenerError>;

    /// Stop accepting peers. Idempotent. Live connections are not closed.
    fn dispose(&self);

    /// The bound address, once started.
    fn local_endpoint(&self) -> Option<SocketAddr>;

    /// Connections currently tracked by this listener.
    fn connections(&self) -> Vec<Arc<Self::Connection>>;

    fn connection_count(&self) -> usize {
        self.connections().len()
    }

    fn endpoint(&self) -> &ConnectionEndpoint {
        self.base().endpoint()
    }

    fn on_new_connection(&self) -> &Observers<NewConnection<Self::Connection>> {
        self.base().on_new_connection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_hands_out_bounded_permits() {
        let limit = ConnectionLimit::new(2);
        let first = limit.try_acquire();
        let second = limit.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert!(limit.try_acquire().is_none());
        assert_eq!(limit.available(), 0);

        drop(first);
        assert_eq!(limit.available(), 1);
        assert!(limit.try_acquire().is_some());
        assert_eq!(limit.max_connections(), 2);
    }
}
