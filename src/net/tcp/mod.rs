//! Stream transport.
//!
//! Frames on the stream are length-prefixed; the body is the same
//! `[kind][payload]` layout datagrams use.
//!
//! ```text
//! +----------------+--------+---------------------+
//! | len (u32, BE)  |  kind  |  payload ...        |
//! +----------------+--------+---------------------+
//!                  |<-------- len bytes --------->|
//! ```
//!
//! The handshake is a single Hello frame answered by an Acknowledgement.
//! Ordering and reliability come from the stream itself.

pub mod connection;
pub mod listener;

pub use connection::TcpConnection;
pub use listener::TcpConnectionListener;

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::net::wire::PacketKind;

pub(crate) const LENGTH_PREFIX: usize = 4;

/// Encode one length-prefixed frame.
pub(crate) fn encode_frame(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let body_len = payload.len() + 1;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Read one frame body (`[kind][payload]`).
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 || len > max_frame_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} outside 1..={max_frame_len}"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_read_back_in_order() {
        let mut wire = encode_frame(PacketKind::Hello, b"hi");
        wire.extend(encode_frame(PacketKind::KeepAlive, &[]));
        assert_eq!(&wire[..4], &3u32.to_be_bytes());

        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), Some(vec![8, b'h', b'i']));
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), Some(vec![12]));
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_and_empty_frames_are_rejected() {
        let wire = encode_frame(PacketKind::Reliable, &[0u8; 100]);
        let err = read_frame(&mut wire.as_slice(), 50).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let empty = 0u32.to_be_bytes();
        let err = read_frame(&mut empty.as_slice(), 50).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
