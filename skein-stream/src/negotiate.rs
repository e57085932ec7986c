//! Key-setup control protocol: a minimal magic-tagged init/reply
//! exchange on channel zero that agrees nonces and channel numbers and
//! derives the flow's armor keys.
//!
//! This stands in for a full key-exchange handshake, which is an
//! external collaborator of the transport. The host installs the result
//! through the same path a real handshake would: a completed exchange
//! yields the armor, the channel pair, and the peer identity for a new
//! flow.

use crate::proto::MAGIC;
use crate::xdr::{XdrReader, XdrWriter};
use skein_core::{ArmorKind, BackoffTimer, Channel, Eid, Error, FlowHandle, Result, SocketHandle};
use skein_crypto::{derive_key_set, Armor};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const KEY_INIT: i32 = 0x21;
const KEY_REPLY: i32 = 0x22;

pub const NONCE_LEN: usize = 16;

/// Initial key-setup retransmission interval.
pub const SETUP_RETRY: Duration = Duration::from_millis(500);
/// Give up on an unanswered key setup after this long.
pub const SETUP_FAIL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    KeyInit(KeyInit),
    KeyReply(KeyReply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInit {
    pub initiator: Eid,
    pub target: Eid,
    pub nonce: [u8; NONCE_LEN],
    /// Channel the initiator listens on; the responder writes this into
    /// the first word of every packet it sends on the new flow.
    pub channel: Channel,
    pub armor: ArmorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReply {
    pub responder: Eid,
    pub nonce_init: [u8; NONCE_LEN],
    pub nonce_resp: [u8; NONCE_LEN],
    /// Channel the responder listens on.
    pub channel: Channel,
}

impl KeyInit {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_u32(MAGIC)
            .put_i32(KEY_INIT)
            .put_opaque(self.initiator.as_bytes())
            .put_opaque(self.target.as_bytes())
            .put_opaque(&self.nonce)
            .put_u32(u32::from(self.channel.0))
            .put_u32(match self.armor {
                ArmorKind::AesCtrHmac => 0,
                ArmorKind::Checksum => 1,
            });
        w.finish()
    }
}

impl KeyReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.put_u32(MAGIC)
            .put_i32(KEY_REPLY)
            .put_opaque(self.responder.as_bytes())
            .put_opaque(&self.nonce_init)
            .put_opaque(&self.nonce_resp)
            .put_u32(u32::from(self.channel.0));
        w.finish()
    }
}

fn fixed_nonce(raw: Vec<u8>) -> Result<[u8; NONCE_LEN]> {
    <[u8; NONCE_LEN]>::try_from(raw).map_err(|_| Error::protocol("bad key-setup nonce length"))
}

fn channel_field(raw: u32) -> Result<Channel> {
    let byte = u8::try_from(raw).map_err(|_| Error::protocol("channel out of range"))?;
    if byte == 0 {
        return Err(Error::protocol("key setup names the control channel"));
    }
    Ok(Channel(byte))
}

/// Decode a control packet (magic already verified by the socket layer,
/// but rechecked here).
pub fn decode_control(buf: &[u8]) -> Result<ControlMsg> {
    let mut r = XdrReader::new(buf);
    if r.get_u32()? != MAGIC {
        return Err(Error::protocol("control packet with wrong magic"));
    }
    match r.get_i32()? {
        KEY_INIT => {
            let initiator = Eid::new(r.get_opaque()?);
            let target = Eid::new(r.get_opaque()?);
            let nonce = fixed_nonce(r.get_opaque()?)?;
            let channel = channel_field(r.get_u32()?)?;
            let armor = match r.get_u32()? {
                0 => ArmorKind::AesCtrHmac,
                1 => ArmorKind::Checksum,
                other => {
                    return Err(Error::protocol(format!("unknown armor kind {other}")));
                }
            };
            Ok(ControlMsg::KeyInit(KeyInit { initiator, target, nonce, channel, armor }))
        }
        KEY_REPLY => {
            let responder = Eid::new(r.get_opaque()?);
            let nonce_init = fixed_nonce(r.get_opaque()?)?;
            let nonce_resp = fixed_nonce(r.get_opaque()?)?;
            let channel = channel_field(r.get_u32()?)?;
            Ok(ControlMsg::KeyReply(KeyReply { responder, nonce_init, nonce_resp, channel }))
        }
        other => Err(Error::protocol(format!("unknown control code {other:#x}"))),
    }
}

/// Derive the armor for a flow from the negotiated identities and nonces.
/// Both ends call this with the same (initiator, target) pair; the
/// `initiator` flag splits the directional keys.
pub fn flow_armor(
    kind: ArmorKind,
    initiator_eid: &Eid,
    target_eid: &Eid,
    nonce_init: &[u8; NONCE_LEN],
    nonce_resp: &[u8; NONCE_LEN],
    initiator: bool,
) -> Armor {
    let mut ikm = XdrWriter::new();
    ikm.put_opaque(initiator_eid.as_bytes())
        .put_opaque(target_eid.as_bytes());
    let mut salt = Vec::with_capacity(NONCE_LEN * 2);
    salt.extend_from_slice(nonce_init);
    salt.extend_from_slice(nonce_resp);
    let keys = derive_key_set(&ikm.finish(), &salt, initiator);
    match kind {
        ArmorKind::AesCtrHmac => Armor::aes_ctr_hmac(keys),
        ArmorKind::Checksum => Armor::checksum(keys.tx_chk, keys.rx_chk),
    }
}

/// An outbound key-setup attempt to one endpoint, retransmitted on an
/// exponential backoff until answered or abandoned.
pub struct Initiator {
    pub id: u64,
    pub target: Eid,
    pub socket: SocketHandle,
    pub remote: SocketAddr,
    /// Channel reserved for the nascent flow on our socket.
    pub local_channel: Channel,
    /// Flow handle pre-bound in the socket table for that channel.
    pub flow_handle: FlowHandle,
    pub nonce: [u8; NONCE_LEN],
    pub armor: ArmorKind,
    pub timer: BackoffTimer,
}

impl Initiator {
    pub fn start(&mut self, now: Instant) {
        self.timer.start(now, SETUP_RETRY);
    }

    pub fn key_init(&self, local_eid: &Eid) -> Vec<u8> {
        KeyInit {
            initiator: local_eid.clone(),
            target: self.target.clone(),
            nonce: self.nonce,
            channel: self.local_channel,
            armor: self.armor,
        }
        .encode()
    }
}

/// Responder-side record of an answered KeyInit, kept so retransmitted
/// inits are answered identically instead of spawning duplicate flows.
pub struct ResponderSession {
    pub flow: FlowHandle,
    pub nonce_resp: [u8; NONCE_LEN],
    pub channel: Channel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_init_roundtrip() {
        let msg = KeyInit {
            initiator: Eid::from("alice"),
            target: Eid::from("bob"),
            nonce: [7; NONCE_LEN],
            channel: Channel(3),
            armor: ArmorKind::Checksum,
        };
        let wire = msg.encode();
        assert_eq!(&wire[..4], &MAGIC.to_be_bytes());
        assert_eq!(decode_control(&wire).unwrap(), ControlMsg::KeyInit(msg));
    }

    #[test]
    fn key_reply_roundtrip() {
        let msg = KeyReply {
            responder: Eid::from("bob"),
            nonce_init: [7; NONCE_LEN],
            nonce_resp: [9; NONCE_LEN],
            channel: Channel(200),
        };
        let wire = msg.encode();
        assert_eq!(decode_control(&wire).unwrap(), ControlMsg::KeyReply(msg));
    }

    #[test]
    fn malformed_control_rejected() {
        assert!(decode_control(&[]).is_err());
        assert!(decode_control(&0xdead_beefu32.to_be_bytes()).is_err());
        // Control channel number is never acceptable for a flow.
        let mut msg = KeyReply {
            responder: Eid::from("b"),
            nonce_init: [0; NONCE_LEN],
            nonce_resp: [0; NONCE_LEN],
            channel: Channel(1),
        }
        .encode();
        let chan_word = msg.len() - 4;
        msg[chan_word..].copy_from_slice(&0u32.to_be_bytes());
        assert!(decode_control(&msg).is_err());
    }

    #[test]
    fn derived_armor_interoperates() {
        let alice = Eid::from("alice");
        let bob = Eid::from("bob");
        let ni = [1u8; NONCE_LEN];
        let nr = [2u8; NONCE_LEN];
        let a = flow_armor(ArmorKind::AesCtrHmac, &alice, &bob, &ni, &nr, true);
        let b = flow_armor(ArmorKind::AesCtrHmac, &alice, &bob, &ni, &nr, false);
        let mut pkt = vec![0u8; 8];
        pkt.extend_from_slice(b"negotiated");
        let mut wire = a.seal(42, &pkt);
        b.open(42, &mut wire).unwrap();
        assert_eq!(wire, pkt);
    }
}
