//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Durations are plain milliseconds; `0` disables the feature where noted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::net::endpoint::{ConnectionEndpoint, IpMode};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Listener configuration (bind address, IP mode, transport).
    pub listener: ListenerConfig,

    /// Defaults for every connection the listener creates or dials.
    pub connection: ConnectionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Which transport a listener or probe uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(format!("unknown transport '{other}' (expected udp or tcp)")),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:22023").
    pub bind_address: String,

    pub ip_mode: IpMode,

    pub transport: TransportKind,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long a stream peer has to send its Hello.
    pub handshake_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:22023".to_string(),
            ip_mode: IpMode::IPv4,
            transport: TransportKind::Udp,
            max_connections: 10_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl ListenerConfig {
    pub fn endpoint(&self) -> Result<ConnectionEndpoint, AddrParseError> {
        let addr: SocketAddr = self.bind_address.parse()?;
        Ok(ConnectionEndpoint::new(addr, self.ip_mode))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Keepalive period; `0` disables keepalives.
    pub keep_alive_interval_ms: u64,

    /// Default `connect` timeout for dialing peers.
    pub connect_timeout_ms: u64,

    /// Hello retransmission period while connecting over datagrams.
    pub handshake_resend_interval_ms: u64,

    /// Close a connection whose peer has been silent this long; `0` disables.
    ///
    /// On by default: a passive datagram connection holds a slot from the
    /// first Hello, and a spoofed sender never speaks again.
    pub disconnect_timeout_ms: u64,

    /// Deliver messages to observers one at a time, in arrival order.
    pub ordered_delivery: bool,

    pub max_datagram_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 10_000,
            connect_timeout_ms: 5_000,
            handshake_resend_interval_ms: 500,
            disconnect_timeout_ms: 30_000,
            ordered_delivery: true,
            max_datagram_size: 65_507,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
