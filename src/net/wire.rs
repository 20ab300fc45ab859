//! Wire framing shared by every transport.
//!
//! Every datagram (and every stream frame body) starts with one
//! [`PacketKind`] byte. The rest of the datagram is the payload.
//!
//! ```text
//!  0        1
//! +--------+---------------------------+
//! |  kind  |  payload ...              |
//! +--------+---------------------------+
//! ```
//!
//! | byte | kind                | payload                |
//! |------|---------------------|------------------------|
//! | 0    | Unreliable          | application bytes      |
//! | 1    | Reliable            | application bytes      |
//! | 2    | FragmentedReliable  | application bytes      |
//! | 8    | Hello               | handshake bytes        |
//! | 9    | Disconnect          | none                   |
//! | 10   | Acknowledgement     | none                   |
//! | 12   | KeepAlive           | none                   |

use std::fmt;

/// Delivery intent of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendOption {
    /// Unreliable, best-effort.
    None,
    Reliable,
    FragmentedReliable,
    /// Liveness probe. Never surfaced to the application.
    KeepAlive,
}

impl SendOption {
    /// Whether messages with this option count as application data.
    pub fn is_data(self) -> bool {
        !matches!(self, SendOption::KeepAlive)
    }
}

impl fmt::Display for SendOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendOption::None => "unreliable",
            SendOption::Reliable => "reliable",
            SendOption::FragmentedReliable => "fragmented_reliable",
            SendOption::KeepAlive => "keepalive",
        };
        f.write_str(name)
    }
}

/// First byte of every frame on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Unreliable = 0,
    Reliable = 1,
    FragmentedReliable = 2,
    Hello = 8,
    Disconnect = 9,
    Acknowledgement = 10,
    KeepAlive = 12,
}

/// Discriminator of the unsolicited connection request.
pub const HELLO: u8 = PacketKind::Hello as u8;

impl PacketKind {
    /// The send option this kind carries, if it is a message kind.
    pub fn send_option(self) -> Option<SendOption> {
        match self {
            PacketKind::Unreliable => Some(SendOption::None),
            PacketKind::Reliable => Some(SendOption::Reliable),
            PacketKind::FragmentedReliable => Some(SendOption::FragmentedReliable),
            PacketKind::KeepAlive => Some(SendOption::KeepAlive),
            PacketKind::Hello | PacketKind::Disconnect | PacketKind::Acknowledgement => None,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    /// The unrecognised byte.
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Unreliable),
            1 => Ok(PacketKind::Reliable),
            2 => Ok(PacketKind::FragmentedReliable),
            8 => Ok(PacketKind::Hello),
            9 => Ok(PacketKind::Disconnect),
            10 => Ok(PacketKind::Acknowledgement),
            12 => Ok(PacketKind::KeepAlive),
            other => Err(other),
        }
    }
}

impl From<SendOption> for PacketKind {
    fn from(option: SendOption) -> Self {
        match option {
            SendOption::None => PacketKind::Unreliable,
            SendOption::Reliable => PacketKind::Reliable,
            SendOption::FragmentedReliable => PacketKind::FragmentedReliable,
            SendOption::KeepAlive => PacketKind::KeepAlive,
        }
    }
}

/// Prefix `payload` with its kind byte.
pub fn frame(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(kind as u8);
    buf.extend_from_slice(payload);
    buf
}
