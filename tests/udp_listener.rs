//! Datagram listener integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use switchyard::crypto::{BlockCipher, CipherFactory, CipherProvider, CryptoError};
use switchyard::net::listener::ListenerError;
use switchyard::net::{
    Connection, ConnectionEndpoint, ConnectionError, ConnectionListener, ConnectionOptions,
    ConnectionState, DisconnectReason, IpMode, NewConnection, SendOption, UdpConnection,
    UdpConnectionListener,
};

mod common;

use common::{disconnects, echo, eventually, messages, new_connections, next, quiet_options};

async fn raw_peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (len, _) = tokio::time::timeout(common::STEP, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf[..len].to_vec()
}

#[tokio::test]
async fn hello_creates_virtual_connection_with_handshake() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    let mut accepted = new_connections(listener.as_ref());

    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), quiet_options());
    client.connect(b"version=7", Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let event = next(&mut accepted).await;
    assert_eq!(event.handshake, b"version=7");
    assert_eq!(event.connection.state(), ConnectionState::Connected);
    assert!(event.connection.is_passive());
    assert_eq!(event.connection.endpoint().addr(), client.local_addr().unwrap());
    assert_eq!(listener.connection_count(), 1);
}

#[tokio::test]
async fn unknown_endpoint_is_admitted_only_by_hello() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    let peer = raw_peer().await;

    peer.send_to(&[1, 0xde, 0xad], addr).await.unwrap();
    peer.send_to(&[], addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.connection_count(), 0);

    peer.send_to(&[8, 1, 2], addr).await.unwrap();
    assert_eq!(recv_datagram(&peer).await, vec![10]);
    assert_eq!(listener.connection_count(), 1);
}

#[tokio::test]
async fn retransmitted_hello_is_acknowledged_without_new_connection() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    let raised = Arc::new(AtomicUsize::new(0));
    let counter = raised.clone();
    listener
        .on_new_connection()
        .subscribe(move |_: &NewConnection<UdpConnection>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let peer = raw_peer().await;
    peer.send_to(&[8], addr).await.unwrap();
    assert_eq!(recv_datagram(&peer).await, vec![10]);
    peer.send_to(&[8], addr).await.unwrap();
    assert_eq!(recv_datagram(&peer).await, vec![10]);

    assert_eq!(listener.connection_count(), 1);
    assert_eq!(raised.load(Ordering::SeqCst), 1);
    let connection = listener.connection(&peer.local_addr().unwrap()).unwrap();
    assert_eq!(connection.statistics().hellos_received(), 2);
}

#[tokio::test]
async fn datagrams_are_routed_by_remote_endpoint() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    echo(listener.as_ref());

    let first = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), quiet_options());
    let second = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), quiet_options());
    first.connect(&[], Duration::from_secs(2)).await.unwrap();
    second.connect(&[], Duration::from_secs(2)).await.unwrap();
    let mut first_rx = messages(first.as_ref());
    let mut second_rx = messages(second.as_ref());

    first.send(b"from-first", SendOption::None).await.unwrap();
    second.send(b"from-second", SendOption::Reliable).await.unwrap();

    assert_eq!(next(&mut first_rx).await, b"from-first");
    assert_eq!(next(&mut second_rx).await, b"from-second");
    assert_eq!(listener.connection_count(), 2);

    let stats = first.statistics();
    assert_eq!(stats.messages_sent(), 1);
    assert_eq!(stats.data_bytes_sent(), 10);
    assert_eq!(stats.data_bytes_received(), 10);
}

#[tokio::test]
async fn close_notifies_peer_and_removes_virtual_connection() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    let mut accepted = new_connections(listener.as_ref());

    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), quiet_options());
    let mut client_events = disconnects(client.as_ref());
    client.connect(&[], Duration::from_secs(2)).await.unwrap();

    let server_side = next(&mut accepted).await.connection;
    let mut server_events = disconnects(server_side.as_ref());

    client.close().await;
    client.close().await;

    assert_eq!(next(&mut client_events).await.reason, DisconnectReason::Local);
    assert_eq!(next(&mut server_events).await.reason, DisconnectReason::Remote);
    assert!(eventually(|| listener.connection_count() == 0).await);
    assert_eq!(client.state(), ConnectionState::NotConnected);
    assert_eq!(server_side.state(), ConnectionState::NotConnected);

    // Exactly one event per connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client_events.try_recv().is_err());
    assert!(server_events.try_recv().is_err());
}

#[tokio::test]
async fn send_requires_connected_state() {
    let client = UdpConnection::new(ConnectionEndpoint::from_addr("127.0.0.1:9".parse().unwrap()));
    let err = client.send(b"early", SendOption::None).await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotConnected(ConnectionState::NotConnected)));
}

#[tokio::test]
async fn connect_times_out_against_silent_peer() {
    let silent = raw_peer().await;
    let client = UdpConnection::with_options(
        ConnectionEndpoint::from_addr(silent.local_addr().unwrap()),
        quiet_options(),
    );
    let mut events = disconnects(client.as_ref());

    let err = client
        .connect(b"hi", Duration::from_millis(350))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectTimeout(_)));
    assert_eq!(client.state(), ConnectionState::NotConnected);

    // Hellos were retransmitted while waiting.
    assert!(client.statistics().hellos_sent() >= 2);
    let first = recv_datagram(&silent).await;
    assert_eq!(first, vec![8, b'h', b'i']);

    // A connection that never connected raises no disconnect event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());

    // And it cannot be reused.
    let again = client.connect(&[], Duration::from_millis(50)).await;
    assert!(matches!(again, Err(ConnectionError::InvalidState(_))));
}

#[tokio::test]
async fn disconnect_during_handshake_is_a_refusal() {
    let server = raw_peer().await;
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        if let Ok((_, from)) = server.recv_from(&mut buf).await {
            let _ = server.send_to(&[9], from).await;
        }
    });

    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(server_addr), quiet_options());
    let err = client.connect(&[], Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectRefused(_)));
    assert_eq!(client.state(), ConnectionState::NotConnected);
}

#[tokio::test]
async fn connection_limit_ignores_extra_hellos() {
    let listener = UdpConnectionListener::with_options(common::loopback(), quiet_options(), 1);
    listener.start().unwrap();
    let addr = listener.local_endpoint().unwrap();

    let first = raw_peer().await;
    first.send_to(&[8], addr).await.unwrap();
    assert_eq!(recv_datagram(&first).await, vec![10]);

    let second = raw_peer().await;
    second.send_to(&[8], addr).await.unwrap();
    let mut buf = [0u8; 16];
    let reply = tokio::time::timeout(Duration::from_millis(200), second.recv_from(&mut buf)).await;
    assert!(reply.is_err());
    assert_eq!(listener.connection_count(), 1);
}

#[tokio::test]
async fn start_and_dispose_are_guarded() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    assert!(matches!(listener.start(), Err(ListenerError::AlreadyStarted)));

    let clash = UdpConnectionListener::new(ConnectionEndpoint::from_addr(addr));
    assert!(matches!(clash.start(), Err(ListenerError::BindFailed { .. })));

    listener.dispose();
    listener.dispose();
    assert!(listener.local_endpoint().is_none());
    assert!(matches!(listener.start(), Err(ListenerError::Disposed)));

    // The port is released once the receive task is gone.
    assert!(
        eventually(|| {
            let rebind = UdpConnectionListener::new(ConnectionEndpoint::from_addr(addr));
            rebind.start().is_ok()
        })
        .await
    );
}

#[tokio::test]
async fn live_connections_survive_listener_dispose() {
    let (listener, addr) = common::start_udp_listener(quiet_options());
    let mut accepted = new_connections(listener.as_ref());
    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), quiet_options());
    client.connect(&[], Duration::from_secs(2)).await.unwrap();
    let server_side = next(&mut accepted).await.connection;

    listener.dispose();
    assert_eq!(server_side.state(), ConnectionState::Connected);

    // Sends through a disposed listener are swallowed.
    server_side.send(b"late", SendOption::None).await.unwrap();
    server_side.close().await;
    assert_eq!(server_side.state(), ConnectionState::NotConnected);
}

#[tokio::test]
async fn oversized_message_is_rejected() {
    let options = ConnectionOptions {
        max_datagram_size: 64,
        ..quiet_options()
    };
    let (_listener, addr) = common::start_udp_listener(options.clone());
    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), options);
    client.connect(&[], Duration::from_secs(2)).await.unwrap();

    let err = client.send(&[0u8; 64], SendOption::None).await.unwrap_err();
    assert!(matches!(err, ConnectionError::MessageTooLarge { len: 65, max: 64 }));
    client.send(&[0u8; 63], SendOption::None).await.unwrap();
}

#[tokio::test]
async fn dual_mode_accepts_ipv4_peers() {
    let endpoint = ConnectionEndpoint::new("[::]:0".parse().unwrap(), IpMode::Dual);
    let listener = UdpConnectionListener::with_options(endpoint, quiet_options(), 8);
    if listener.start().is_err() {
        // Host without IPv6 support.
        return;
    }
    let port = listener.local_endpoint().unwrap().port();
    let mut accepted = new_connections(listener.as_ref());

    let client = UdpConnection::with_options(
        ConnectionEndpoint::from_addr(([127, 0, 0, 1], port).into()),
        quiet_options(),
    );
    client.connect(&[], Duration::from_secs(2)).await.unwrap();

    let event = next(&mut accepted).await;
    let peer = event.connection.endpoint().addr();
    assert!(peer.is_ipv6());
    assert_eq!(event.connection.endpoint().ip_mode(), IpMode::Dual);
}

/// Identity "cipher" standing in for a hardware-backed implementation.
struct Passthrough;

impl BlockCipher for Passthrough {
    fn block_size(&self) -> usize {
        16
    }

    fn encrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        output.copy_from_slice(input);
        Ok(())
    }

    fn decrypt_block(&self, input: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        output.copy_from_slice(input);
        Ok(())
    }
}

struct PassthroughProvider;

impl CipherProvider for PassthroughProvider {
    fn create_cipher(
        &self,
        key_size_bits: usize,
        _key: &[u8],
    ) -> Result<Option<Box<dyn BlockCipher>>, CryptoError> {
        Ok((key_size_bits == 128).then(|| Box::new(Passthrough) as Box<dyn BlockCipher>))
    }
}

#[tokio::test]
async fn cipher_override_reaches_virtual_connections() {
    let options = ConnectionOptions {
        ciphers: CipherFactory::with_override(Arc::new(PassthroughProvider)),
        ..quiet_options()
    };
    let (listener, addr) = common::start_udp_listener(options);
    let mut accepted = new_connections(listener.as_ref());

    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), quiet_options());
    client.connect(&[], Duration::from_secs(2)).await.unwrap();
    let server_side = next(&mut accepted).await.connection;

    assert!(server_side.ciphers().has_override());
    let cipher = server_side.ciphers().create_cipher(128, &[0u8; 16]).unwrap();
    assert_eq!(cipher.encrypt_padded(b"token").unwrap()[..5], *b"token");

    // The client kept the default AES factory.
    assert!(!client.ciphers().has_override());
    let aes = client.ciphers().create_cipher(128, &[0u8; 16]).unwrap();
    assert_ne!(aes.encrypt_padded(b"token").unwrap()[..5], *b"token");
}

#[tokio::test]
async fn closed_connection_that_never_connected_is_released() {
    let silent = raw_peer().await;
    let client = UdpConnection::with_options(
        ConnectionEndpoint::from_addr(silent.local_addr().unwrap()),
        quiet_options(),
    );
    // Handlers that hold their own connection are common.
    let held = Arc::clone(&client);
    client.on_data_received().subscribe(move |_| {
        let _ = held.state();
    });
    let held = Arc::clone(&client);
    client.on_disconnected().subscribe(move |_| {
        let _ = held.state();
    });

    let err = client.connect(&[], Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectTimeout(_)));
    client.close().await;

    let weak = Arc::downgrade(&client);
    drop(client);
    assert!(eventually(|| weak.upgrade().is_none()).await);
}

#[tokio::test]
async fn unordered_delivery_hands_over_every_message() {
    let unordered = ConnectionOptions {
        ordered_delivery: false,
        ..quiet_options()
    };
    let (listener, addr) = common::start_udp_listener(unordered.clone());
    echo(listener.as_ref());
    let mut accepted = new_connections(listener.as_ref());

    let client = UdpConnection::with_options(ConnectionEndpoint::from_addr(addr), unordered);
    let mut replies = messages(client.as_ref());
    let mut client_events = disconnects(client.as_ref());
    client.connect(&[], Duration::from_secs(2)).await.unwrap();
    let server_side = next(&mut accepted).await.connection;
    let mut server_events = disconnects(server_side.as_ref());

    for i in 0..20u8 {
        client.send(&[i], SendOption::None).await.unwrap();
    }
    let mut echoed = Vec::new();
    for _ in 0..20 {
        echoed.push(next(&mut replies).await[0]);
    }
    echoed.sort_unstable();
    assert_eq!(echoed, (0..20u8).collect::<Vec<_>>());
    assert_eq!(server_side.statistics().messages_received(), 20);

    client.close().await;
    assert_eq!(next(&mut client_events).await.reason, DisconnectReason::Local);
    assert_eq!(next(&mut server_events).await.reason, DisconnectReason::Remote);
    assert!(eventually(|| listener.connection_count() == 0).await);
}
