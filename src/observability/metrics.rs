//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Mirror connection statistics into the `metrics` facade
//! - Expose a Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `switchyard_bytes_sent_total` / `switchyard_bytes_received_total`
//!   (counter): wire bytes by send option
//! - `switchyard_messages_sent_total` / `switchyard_messages_received_total`
//!   (counter): messages by send option, keepalives included
//! - `switchyard_keepalives_sent_total` (counter)
//! - `switchyard_connections_active` (gauge): connections in `Connected`
//! - `switchyard_datagrams_dropped_total` (counter): by reason
//! - `switchyard_handshakes_rejected_total` (counter): stream peers turned
//!   away before a connection existed, by reason
//!
//! Without an installed recorder every call is a no-op.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::net::wire::SendOption;

fn option_label(option: SendOption) -> &'static str {
    match option {
        SendOption::None => "unreliable",
        SendOption::Reliable => "reliable",
        SendOption::FragmentedReliable => "fragmented_reliable",
        SendOption::KeepAlive => "keepalive",
    }
}

/// Install the Prometheus recorder and its HTTP listener on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics endpoint"),
    }
}

pub fn record_sent(option: SendOption, wire_len: usize) {
    let label = option_label(option);
    metrics::counter!("switchyard_bytes_sent_total", "option" => label).increment(wire_len as u64);
    metrics::counter!("switchyard_messages_sent_total", "option" => label).increment(1);
    if option == SendOption::KeepAlive {
        metrics::counter!("switchyard_keepalives_sent_total").increment(1);
    }
}

pub fn record_received(option: SendOption, wire_len: usize) {
    let label = option_label(option);
    metrics::counter!("switchyard_bytes_received_total", "option" => label)
        .increment(wire_len as u64);
    metrics::counter!("switchyard_messages_received_total", "option" => label).increment(1);
}

pub fn record_connection_opened() {
    metrics::gauge!("switchyard_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    metrics::gauge!("switchyard_connections_active").decrement(1.0);
}

pub fn record_datagram_dropped(reason: &'static str) {
    metrics::counter!("switchyard_datagrams_dropped_total", "reason" => reason).increment(1);
}

pub fn record_handshake_rejected(reason: &'static str) {
    metrics::counter!("switchyard_handshakes_rejected_total", "reason" => reason).increment(1);
}
