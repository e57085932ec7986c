use serde::{Deserialize, Serialize};
use std::fmt;

/// One-byte channel identifier naming a flow at a given remote endpoint.
/// Channel 0 is reserved for control traffic (key setup, lookups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel(pub u8);

impl Channel {
    /// Reserved control channel.
    pub const CONTROL: Channel = Channel(0);

    pub fn is_control(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit stream identifier. The top bit encodes the creator: clear for
/// streams this side created, set for streams the peer created. Each side
/// therefore sees its own creations in the low half of the space and XORs
/// the bit when interpreting identifiers received on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u16);

impl StreamId {
    /// Creator flag bit.
    pub const ORIGIN: u16 = 0x8000;
    /// The root stream of a flow (both halves of the space).
    pub const ROOT: StreamId = StreamId(0);

    /// Interpretation flip between the two sides' views of the SID space.
    pub fn flip_origin(self) -> StreamId {
        StreamId(self.0 ^ Self::ORIGIN)
    }

    /// True if the creator bit marks this SID as peer-created.
    pub fn is_peer_origin(self) -> bool {
        self.0 & Self::ORIGIN != 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Endpoint identifier: an opaque byte string naming a peer independently
/// of its current network address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eid(Vec<u8>);

impl Eid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Eid {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl From<&str> for Eid {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eid({self})")
    }
}

/// Host-local handle naming a flow. Never reused within a host's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowHandle(pub u64);

impl fmt::Display for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Host-local handle naming a bound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Host-local handle naming a stream. Never reused within a host's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Observed connectivity of a flow or peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Down,
    Stalled,
    Up,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStatus::Down => "down",
            LinkStatus::Stalled => "stalled",
            LinkStatus::Up => "up",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_origin_flip() {
        let sid = StreamId(0x0001);
        assert!(!sid.is_peer_origin());
        let flipped = sid.flip_origin();
        assert!(flipped.is_peer_origin());
        assert_eq!(flipped.flip_origin(), sid);
        assert_eq!(StreamId::ROOT.flip_origin(), StreamId(StreamId::ORIGIN));
    }

    #[test]
    fn eid_display_is_hex() {
        let eid = Eid::new(vec![0xde, 0xad]);
        assert_eq!(eid.to_string(), "dead");
    }

    #[test]
    fn control_channel() {
        assert!(Channel::CONTROL.is_control());
        assert!(!Channel(7).is_control());
    }
}
