//! Connection multiplexing and lifecycle layer.
//!
//! Datagram and stream transports behind one [`Connection`] contract: a
//! shared state machine, a datagram listener that demultiplexes one socket
//! into virtual connections, a keepalive scheduler that never races
//! teardown, and a pluggable block-cipher factory.

pub mod config;
pub mod crypto;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::TransportConfig;
pub use crypto::{BlockCipher, CipherFactory, CipherProvider, CryptoError};
pub use lifecycle::Shutdown;
pub use net::{
    Connection, ConnectionEndpoint, ConnectionError, ConnectionListener, ConnectionOptions,
    ConnectionState, DisconnectReason, IpMode, SendOption, TcpConnection, TcpConnectionListener,
    UdpConnection, UdpConnectionListener,
};
