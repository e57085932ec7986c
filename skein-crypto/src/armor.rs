use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::chk32::Chk32;
use crate::keys::KeySet;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Flow header length; no armored packet may be shorter once stripped.
const MIN_PACKET: usize = 8;
/// Offset at which encryption starts. The first word (channel and low
/// sequence bits) stays cleartext so the receiver can locate the flow and
/// reconstruct the sequence before decrypting.
const ENC_OFFSET: usize = 4;
/// Truncated HMAC-SHA-256 tag length.
const MAC_LEN: usize = 16;
/// Checksum trailer length.
const SUM_LEN: usize = 4;
/// Magic word bound into the initialization vector ("VXAf").
const IV_MAGIC: u32 = 0x5658_4166;

/// Wire overhead added by the AES-CTR + HMAC armor.
pub const ARMOR_OVERHEAD_AES: usize = MAC_LEN;
/// Wire overhead added by the checksum armor.
pub const ARMOR_OVERHEAD_CHECKSUM: usize = SUM_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArmorError {
    #[error("packet too short to carry armor")]
    Runt,
    #[error("packet failed authentication")]
    Verification,
}

/// Per-packet protection for a flow. A closed set of variants dispatched
/// by tag; both bind the 64-bit packet sequence into the protection as a
/// pseudo-header so cross-sequence replays never verify.
pub enum Armor {
    /// AES-128-CTR encryption with a truncated HMAC-SHA-256 tag.
    AesCtrHmac(Box<KeySet>),
    /// Keyed mod-65537 checksum; integrity only, for non-confidential
    /// test configurations.
    Checksum { tx_key: u32, rx_key: u32 },
}

fn iv_for(seq: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&((seq >> 32) as u32).to_be_bytes());
    iv[4..8].copy_from_slice(&(seq as u32).to_be_bytes());
    iv[8..12].copy_from_slice(&IV_MAGIC.to_be_bytes());
    // Final word is the per-packet CTR block counter, starting at zero.
    iv
}

impl Armor {
    pub fn aes_ctr_hmac(keys: KeySet) -> Self {
        Armor::AesCtrHmac(Box::new(keys))
    }

    pub fn checksum(tx_key: u32, rx_key: u32) -> Self {
        Armor::Checksum { tx_key, rx_key }
    }

    /// Bytes this armor appends to every packet.
    pub fn overhead(&self) -> usize {
        match self {
            Armor::AesCtrHmac(_) => ARMOR_OVERHEAD_AES,
            Armor::Checksum { .. } => ARMOR_OVERHEAD_CHECKSUM,
        }
    }

    /// Protect an outbound packet. `pkt` must already carry the full flow
    /// header; the returned buffer is the wire datagram.
    pub fn seal(&self, seq: u64, pkt: &[u8]) -> Vec<u8> {
        debug_assert!(pkt.len() >= MIN_PACKET);
        match self {
            Armor::AesCtrHmac(keys) => {
                let iv = iv_for(seq);
                let mut out = Vec::with_capacity(pkt.len() + MAC_LEN);
                out.extend_from_slice(pkt);
                let mut cipher = Aes128Ctr::new((&keys.tx_enc).into(), (&iv).into());
                cipher.apply_keystream(&mut out[ENC_OFFSET..]);

                let mut mac = HmacSha256::new_from_slice(&keys.tx_mac)
                    .expect("HMAC accepts keys of any length");
                mac.update(&iv[..8]);
                mac.update(&out);
                let tag = mac.finalize().into_bytes();
                out.extend_from_slice(&tag[..MAC_LEN]);
                out
            }
            Armor::Checksum { tx_key, .. } => {
                let mut out = Vec::with_capacity(pkt.len() + SUM_LEN);
                out.extend_from_slice(pkt);
                let sum = seq_checksum(seq, &out) ^ tx_key;
                out.extend_from_slice(&sum.to_be_bytes());
                out
            }
        }
    }

    /// Authenticate an inbound packet in place, stripping the armor
    /// trailer and (for the AES variant) decrypting the body.
    pub fn open(&self, seq: u64, pkt: &mut Vec<u8>) -> Result<(), ArmorError> {
        match self {
            Armor::AesCtrHmac(keys) => {
                let body_len = pkt
                    .len()
                    .checked_sub(MAC_LEN)
                    .filter(|&n| n >= MIN_PACKET)
                    .ok_or(ArmorError::Runt)?;

                let iv = iv_for(seq);
                let mut mac = HmacSha256::new_from_slice(&keys.rx_mac)
                    .expect("HMAC accepts keys of any length");
                mac.update(&iv[..8]);
                mac.update(&pkt[..body_len]);
                if mac.verify_truncated_left(&pkt[body_len..]).is_err() {
                    debug!(seq, "armor: MAC verification failed");
                    return Err(ArmorError::Verification);
                }

                pkt.truncate(body_len);
                let mut cipher = Aes128Ctr::new((&keys.rx_enc).into(), (&iv).into());
                cipher.apply_keystream(&mut pkt[ENC_OFFSET..]);
                Ok(())
            }
            Armor::Checksum { rx_key, .. } => {
                let body_len = pkt
                    .len()
                    .checked_sub(SUM_LEN)
                    .filter(|&n| n >= MIN_PACKET)
                    .ok_or(ArmorError::Runt)?;
                let expect = seq_checksum(seq, &pkt[..body_len]) ^ rx_key;
                let mut got = [0u8; SUM_LEN];
                got.copy_from_slice(&pkt[body_len..]);
                if u32::from_be_bytes(got) != expect {
                    debug!(seq, "armor: checksum mismatch");
                    return Err(ArmorError::Verification);
                }
                pkt.truncate(body_len);
                Ok(())
            }
        }
    }
}

/// Checksum of a packet with the 64-bit sequence as a pseudo-header.
fn seq_checksum(seq: u64, body: &[u8]) -> u32 {
    let mut chk = Chk32::new();
    chk.update(&seq.to_be_bytes());
    chk.update(body);
    chk.finish()
}
