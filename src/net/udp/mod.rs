//! Datagram transport.
//!
//! # Data Flow
//! ```text
//! Client:
//!     UdpConnection::connect
//!     → own socket, connected to the remote endpoint
//!     → Hello (re-sent until Acknowledgement or timeout)
//!
//! Server:
//!     UdpConnectionListener (one shared socket)
//!     → receive loop → lookup sender in the virtual connection table
//!         → known:    hand datagram to that UdpConnection
//!         → unknown:  Hello?  create + insert + hand datagram + raise event
//!                     other?  drop silently
//! ```

pub mod connection;
pub mod listener;
mod socket;

pub use connection::UdpConnection;
pub use listener::UdpConnectionListener;
