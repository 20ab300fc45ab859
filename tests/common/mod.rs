//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use switchyard::net::{
    Connection, ConnectionEndpoint, ConnectionListener, ConnectionOptions, DataReceived,
    Disconnected, NewConnection, TcpConnectionListener, UdpConnectionListener,
};

pub const STEP: Duration = Duration::from_secs(5);

pub fn loopback() -> ConnectionEndpoint {
    ConnectionEndpoint::from_addr("127.0.0.1:0".parse().unwrap())
}

/// Options with keepalives off and a quick handshake resend.
pub fn quiet_options() -> ConnectionOptions {
    ConnectionOptions {
        keep_alive_interval: None,
        handshake_resend_interval: Duration::from_millis(100),
        ..ConnectionOptions::default()
    }
}

pub fn start_udp_listener(options: ConnectionOptions) -> (Arc<UdpConnectionListener>, SocketAddr) {
    let listener = UdpConnectionListener::with_options(loopback(), options, 64);
    listener.start().unwrap();
    let addr = listener.local_endpoint().unwrap();
    (listener, addr)
}

pub fn start_tcp_listener(options: ConnectionOptions) -> (Arc<TcpConnectionListener>, SocketAddr) {
    let listener =
        TcpConnectionListener::with_options(loopback(), options, 64, Duration::from_secs(2));
    listener.start().unwrap();
    let addr = listener.local_endpoint().unwrap();
    (listener, addr)
}

/// Echo every message back on the connection it arrived on.
pub fn echo<L: ConnectionListener>(listener: &L) {
    listener
        .on_new_connection()
        .subscribe(|event: &NewConnection<L::Connection>| {
            let connection = Arc::downgrade(&event.connection);
            event
                .connection
                .on_data_received()
                .subscribe(move |message: &DataReceived| {
                    if let Some(connection) = connection.upgrade() {
                        let bytes = message.bytes.clone();
                        let option = message.send_option;
                        tokio::spawn(async move {
                            let _ = connection.send(&bytes, option).await;
                        });
                    }
                });
        });
}

/// Forward every new connection event to a channel.
pub fn new_connections<L: ConnectionListener>(
    listener: &L,
) -> mpsc::UnboundedReceiver<NewConnection<L::Connection>> {
    let (tx, rx) = mpsc::unbounded_channel();
    listener
        .on_new_connection()
        .subscribe(move |event: &NewConnection<L::Connection>| {
            let _ = tx.send(event.clone());
        });
    rx
}

pub fn messages<C: Connection + ?Sized>(connection: &C) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    connection
        .on_data_received()
        .subscribe(move |message: &DataReceived| {
            let _ = tx.send(message.bytes.clone());
        });
    rx
}

pub fn disconnects<C: Connection + ?Sized>(connection: &C) -> mpsc::UnboundedReceiver<Disconnected> {
    let (tx, rx) = mpsc::unbounded_channel();
    connection
        .on_disconnected()
        .subscribe(move |event: &Disconnected| {
            let _ = tx.send(event.clone());
        });
    rx
}

/// Receive the next item or fail the test after [`STEP`].
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Poll `condition` until it holds or [`STEP`] elapses.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
