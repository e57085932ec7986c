use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Directional armor keys for one flow: AES-128 encryption keys and
/// HMAC-SHA-256 keys for each direction. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    pub tx_enc: [u8; 16],
    pub tx_mac: [u8; 32],
    pub rx_enc: [u8; 16],
    pub rx_mac: [u8; 32],
    /// Direction keys for the checksum armor, split the same way.
    pub tx_chk: u32,
    pub rx_chk: u32,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.write_str("KeySet(..)")
    }
}

/// Derive a flow key set from handshake output.
///
/// Both ends call this with the same `secret` and `salt`; the `initiator`
/// flag assigns the two directional halves so that one side's transmit
/// keys are the other side's receive keys.
pub fn derive_key_set(secret: &[u8], salt: &[u8], initiator: bool) -> KeySet {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = [0u8; 104];
    hk.expand(b"skein flow armor v1", &mut okm)
        .expect("length fits HKDF-SHA-256 output bound");

    let mut enc_i = [0u8; 16];
    let mut mac_i = [0u8; 32];
    let mut enc_r = [0u8; 16];
    let mut mac_r = [0u8; 32];
    enc_i.copy_from_slice(&okm[0..16]);
    mac_i.copy_from_slice(&okm[16..48]);
    enc_r.copy_from_slice(&okm[48..64]);
    mac_r.copy_from_slice(&okm[64..96]);
    let chk_i = u32::from_be_bytes([okm[96], okm[97], okm[98], okm[99]]);
    let chk_r = u32::from_be_bytes([okm[100], okm[101], okm[102], okm[103]]);
    okm.zeroize();

    if initiator {
        KeySet {
            tx_enc: enc_i,
            tx_mac: mac_i,
            rx_enc: enc_r,
            rx_mac: mac_r,
            tx_chk: chk_i,
            rx_chk: chk_r,
        }
    } else {
        KeySet {
            tx_enc: enc_r,
            tx_mac: mac_r,
            rx_enc: enc_i,
            rx_mac: mac_i,
            tx_chk: chk_r,
            rx_chk: chk_i,
        }
    }
}
