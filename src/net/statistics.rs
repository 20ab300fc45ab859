//! Per-connection traffic counters.
//!
//! Counters are monotonically increasing atomics. Only the owning
//! connection's send/receive paths write them; any thread may read them.
//! "Total" byte counters include every frame on the wire (handshake,
//! keepalive, disconnect, acknowledgement). "Data" counters only include
//! application payload bytes.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::net::wire::SendOption;
use crate::observability::metrics;

#[derive(Debug, Default)]
pub struct ConnectionStatistics {
    total_bytes_sent: AtomicU64,
    data_bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    unreliable_messages_sent: AtomicU64,
    reliable_messages_sent: AtomicU64,
    fragmented_messages_sent: AtomicU64,
    keepalives_sent: AtomicU64,
    hellos_sent: AtomicU64,

    total_bytes_received: AtomicU64,
    data_bytes_received: AtomicU64,
    messages_received: AtomicU64,
    unreliable_messages_received: AtomicU64,
    reliable_messages_received: AtomicU64,
    fragmented_messages_received: AtomicU64,
    keepalives_received: AtomicU64,
    hellos_received: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatisticsSnapshot {
    pub total_bytes_sent: u64,
    pub data_bytes_sent: u64,
    pub messages_sent: u64,
    pub unreliable_messages_sent: u64,
    pub reliable_messages_sent: u64,
    pub fragmented_messages_sent: u64,
    pub keepalives_sent: u64,
    pub hellos_sent: u64,
    pub total_bytes_received: u64,
    pub data_bytes_received: u64,
    pub messages_received: u64,
    pub unreliable_messages_received: u64,
    pub reliable_messages_received: u64,
    pub fragmented_messages_received: u64,
    pub keepalives_received: u64,
    pub hellos_received: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ConnectionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing message of `payload_len` bytes that took
    /// `wire_len` bytes on the wire.
    pub(crate) fn log_sent(&self, option: SendOption, payload_len: usize, wire_len: usize) {
        bump(&self.total_bytes_sent, wire_len as u64);
        match option {
            SendOption::KeepAlive => bump(&self.keepalives_sent, 1),
            SendOption::None => bump(&self.unreliable_messages_sent, 1),
            SendOption::Reliable => bump(&self.reliable_messages_sent, 1),
            SendOption::FragmentedReliable => bump(&self.fragmented_messages_sent, 1),
        }
        if option.is_data() {
            bump(&self.data_bytes_sent, payload_len as u64);
            bump(&self.messages_sent, 1);
        }
        metrics::record_sent(option, wire_len);
    }

    /// Record an incoming message; mirror of [`Self::log_sent`].
    pub(crate) fn log_received(&self, option: SendOption, payload_len: usize, wire_len: usize) {
        bump(&self.total_bytes_received, wire_len as u64);
        match option {
            SendOption::KeepAlive => bump(&self.keepalives_received, 1),
            SendOption::None => bump(&self.unreliable_messages_received, 1),
            SendOption::Reliable => bump(&self.reliable_messages_received, 1),
            SendOption::FragmentedReliable => bump(&self.fragmented_messages_received, 1),
        }
        if option.is_data() {
            bump(&self.data_bytes_received, payload_len as u64);
            bump(&self.messages_received, 1);
        }
        metrics::record_received(option, wire_len);
    }

    pub(crate) fn log_hello_sent(&self, wire_len: usize) {
        bump(&self.hellos_sent, 1);
        bump(&self.total_bytes_sent, wire_len as u64);
    }

    pub(crate) fn log_hello_received(&self, wire_len: usize) {
        bump(&self.hellos_received, 1);
        bump(&self.total_bytes_received, wire_len as u64);
    }

    /// Disconnect and acknowledgement frames: bytes only.
    pub(crate) fn log_control_sent(&self, wire_len: usize) {
        bump(&self.total_bytes_sent, wire_len as u64);
    }

    pub(crate) fn log_control_received(&self, wire_len: usize) {
        bump(&self.total_bytes_received, wire_len as u64);
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn data_bytes_sent(&self) -> u64 {
        self.data_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn keepalives_sent(&self) -> u64 {
        self.keepalives_sent.load(Ordering::Relaxed)
    }

    pub fn hellos_sent(&self) -> u64 {
        self.hellos_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received.load(Ordering::Relaxed)
    }

    pub fn data_bytes_received(&self) -> u64 {
        self.data_bytes_received.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn keepalives_received(&self) -> u64 {
        self.keepalives_received.load(Ordering::Relaxed)
    }

    pub fn hellos_received(&self) -> u64 {
        self.hellos_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatisticsSnapshot {
            total_bytes_sent: load(&self.total_bytes_sent),
            data_bytes_sent: load(&self.data_bytes_sent),
            messages_sent: load(&self.messages_sent),
            unreliable_messages_sent: load(&self.unreliable_messages_sent),
            reliable_messages_sent: load(&self.reliable_messages_sent),
            fragmented_messages_sent: load(&self.fragmented_messages_sent),
            keepalives_sent: load(&self.keepalives_sent),
            hellos_sent: load(&self.hellos_sent),
            total_bytes_received: load(&self.total_bytes_received),
            data_bytes_received: load(&self.data_bytes_received),
            messages_received: load(&self.messages_received),
            unreliable_messages_received: load(&self.unreliable_messages_received),
            reliable_messages_received: load(&self.reliable_messages_received),
            fragmented_messages_received: load(&self.fragmented_messages_received),
            keepalives_received: load(&self.keepalives_received),
            hellos_received: load(&self.hellos_received),
        }
    }
}
