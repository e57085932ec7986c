#![forbid(unsafe_code)]

//! Packet armor for skein flows.
//!
//! Every packet of a flow is protected by one of two interchangeable
//! armors sharing a contract: given the packet's 64-bit sequence number
//! and its cleartext, produce the wire form; given a sequence number and
//! wire bytes, authenticate-and-strip or reject. The sequence number is
//! bound into the protection as a pseudo-header, so a packet replayed
//! under a different sequence never verifies.

pub mod armor;
pub mod chk32;
pub mod keys;

pub use armor::{Armor, ArmorError, ARMOR_OVERHEAD_AES, ARMOR_OVERHEAD_CHECKSUM};
pub use chk32::Chk32;
pub use keys::{derive_key_set, KeySet};

/// Result alias for armor operations.
pub type Result<T, E = ArmorError> = core::result::Result<T, E>;
