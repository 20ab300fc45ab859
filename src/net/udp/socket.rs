//! Datagram socket construction honouring the IP mode.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::net::endpoint::IpMode;

/// Bind a non-blocking UDP socket for `mode`.
///
/// IPv6 sockets are explicitly set v6-only or dual-stack so the outcome
/// does not depend on the host's default. Must be called from within a
/// tokio runtime.
pub(crate) fn bind(addr: SocketAddr, mode: IpMode) -> io::Result<UdpSocket> {
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
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(mode == IpMode::IPv6)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&mode.normalize(addr).into())?;
    UdpSocket::from_std(socket.into())
}
