//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Datagram peer
//!     → udp/listener.rs (one socket, demultiplex by remote endpoint)
//!     → udp/connection.rs (virtual connection, handshake, dispatch)
//!     → connection.rs (state machine, observers)
//!
//! Stream peer
//!     → tcp/listener.rs (accept loop, connection limits, Hello)
//!     → tcp/connection.rs (length-prefixed frames)
//!     → connection.rs
//!
//! Connection States:
//!     NotConnected → Connecting → Connected → Disconnecting → NotConnected
//! ```
//!
//! # Design Decisions
//! - Unknown datagram endpoints are admitted only by a Hello
//! - Observers run on a per-connection dispatcher task, never on a socket task
//! - Keepalive ticks and disposal share one lock

pub mod connection;
pub mod endpoint;
pub mod event;
pub mod keepalive;
pub mod listener;
pub mod statistics;
pub mod tcp;
pub mod udp;
pub mod wire;

pub use connection::{
    Connection, ConnectionError, ConnectionId, ConnectionOptions, ConnectionState,
    DisconnectReason,
};
pub use endpoint::{ConnectionEndpoint, IpMode};
pub use event::{DataReceived, Disconnected, NewConnection, Observers, SubscriptionId};
pub use listener::{ConnectionListener, ListenerError};
pub use statistics::{ConnectionStatistics, StatisticsSnapshot};
pub use tcp::{TcpConnection, TcpConnectionListener};
pub use udp::{UdpConnection, UdpConnectionListener};
pub use wire::SendOption;
