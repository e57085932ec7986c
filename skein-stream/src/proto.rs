//! Wire-level protocol definitions shared by the flow and stream layers:
//! header layouts, packet types, flag bits, and the sequence-number
//! reconstruction arithmetic.

use nom::number::complete::{be_u16, be_u32, u8 as nom_u8};
use nom::IResult;

/// Control magic: "SST" with a zero top byte so control packets are
/// distinguishable from flow traffic by their first byte.
pub const MAGIC: u32 = 0x0053_5354;

/// Fixed flow header: channel/sequence word plus acknowledgment word.
pub const FLOW_HDR: usize = 8;

/// Header lengths including the flow header.
pub const HDR_INIT: usize = FLOW_HDR + 8;
pub const HDR_REPLY: usize = FLOW_HDR + 8;
pub const HDR_DATA: usize = FLOW_HDR + 8;
pub const HDR_DATAGRAM: usize = FLOW_HDR + 4;
pub const HDR_RESET: usize = FLOW_HDR + 4;

/// Cap on service negotiation messages.
pub const MAX_SERVICE_MSG: usize = 1024;

/// Bits in the flow sequence/ACK bitmasks.
pub const MASK_BITS: u32 = 32;
/// Wire width of the packet sequence field.
pub const SEQ_BITS: u32 = 24;
/// Wire width of the acknowledgment sequence field.
pub const ACK_SEQ_BITS: u32 = 28;
/// Maximum value of the contiguous-run ACK counter.
pub const ACK_CT_MAX: u32 = 15;

/// Major packet types (upper nibble of the stream header type byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Init = 0x1,
    Reply = 0x2,
    Data = 0x3,
    Datagram = 0x4,
    Reset = 0x5,
    Attach = 0x6,
    Detach = 0x7,
}

impl PacketType {
    pub fn from_nibble(nibble: u8) -> Option<PacketType> {
        match nibble {
            0x1 => Some(PacketType::Init),
            0x2 => Some(PacketType::Reply),
            0x3 => Some(PacketType::Data),
            0x4 => Some(PacketType::Datagram),
            0x5 => Some(PacketType::Reset),
            0x6 => Some(PacketType::Attach),
            0x7 => Some(PacketType::Detach),
            _ => None,
        }
    }
}

// Subtype flags for Init/Reply/Data packets.
pub const FLAG_PUSH: u8 = 0x4;
pub const FLAG_MESSAGE: u8 = 0x2;
pub const FLAG_CLOSE: u8 = 0x1;
pub const FLAG_DATA_ALL: u8 = 0x7;

// Flags for Datagram packets.
pub const FLAG_DGRAM_BEGIN: u8 = 0x2;
pub const FLAG_DGRAM_END: u8 = 0x1;

/// Service negotiation codes carried in XDR messages on root substreams.
pub const CONNECT_REQUEST: i32 = 0x101;
pub const CONNECT_REPLY: i32 = 0x201;

/// Common 4-byte stream header present in every stream-layer packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Stream ID as written by the sender (its view of the SID space).
    pub sid: u16,
    pub ptype: PacketType,
    /// Lower nibble of the type byte.
    pub flags: u8,
    /// Receive window exponent (lower five bits of the window byte).
    pub win_exp: u8,
}

pub fn parse_stream_header(input: &[u8]) -> IResult<&[u8], StreamHeader> {
    let (input, sid) = be_u16(input)?;
    let (input, type_byte) = nom_u8(input)?;
    let (input, win_byte) = nom_u8(input)?;
    let ptype = PacketType::from_nibble(type_byte >> 4).ok_or(nom::Err::Error(
        nom::error::Error::new(input, nom::error::ErrorKind::Tag),
    ))?;
    Ok((
        input,
        StreamHeader {
            sid,
            ptype,
            flags: type_byte & 0x0f,
            win_exp: win_byte & 0x1f,
        },
    ))
}

/// Extra fields of Init and Reply packets.
pub fn parse_init_fields(input: &[u8]) -> IResult<&[u8], (u16, u16)> {
    let (input, new_sid) = be_u16(input)?;
    let (input, tsn) = be_u16(input)?;
    Ok((input, (new_sid, tsn)))
}

/// Extra field of Data packets.
pub fn parse_data_fields(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

fn put_header(buf: &mut [u8], sid: u16, ptype: PacketType, flags: u8, win_exp: u8) {
    buf[0..2].copy_from_slice(&sid.to_be_bytes());
    buf[2] = ((ptype as u8) << 4) | (flags & 0x0f);
    buf[3] = win_exp & 0x1f;
}

/// Write an 8-byte Init/Reply header into `buf`.
pub fn encode_init(
    buf: &mut [u8],
    ptype: PacketType,
    parent_sid: u16,
    flags: u8,
    win_exp: u8,
    new_sid: u16,
    tsn: u16,
) {
    debug_assert!(matches!(ptype, PacketType::Init | PacketType::Reply));
    put_header(buf, parent_sid, ptype, flags, win_exp);
    buf[4..6].copy_from_slice(&new_sid.to_be_bytes());
    buf[6..8].copy_from_slice(&tsn.to_be_bytes());
}

/// Write an 8-byte Data header into `buf`.
pub fn encode_data(buf: &mut [u8], sid: u16, flags: u8, win_exp: u8, tsn: u32) {
    put_header(buf, sid, PacketType::Data, flags, win_exp);
    buf[4..8].copy_from_slice(&tsn.to_be_bytes());
}

/// Write a 4-byte Datagram header into `buf`.
pub fn encode_datagram(buf: &mut [u8], sid: u16, flags: u8, win_exp: u8) {
    put_header(buf, sid, PacketType::Datagram, flags, win_exp);
}

/// Write a 4-byte Reset header into `buf`.
pub fn encode_reset(buf: &mut [u8], sid: u16, win_exp: u8) {
    put_header(buf, sid, PacketType::Reset, 0, win_exp);
}

/// Signed distance from `reference` to a truncated `wire` field of the
/// given width, interpreting the wire value as the nearest representative
/// (the delta is sign-extended from `bits` bits).
pub fn seq_delta(wire: u32, reference: u64, bits: u32) -> i32 {
    let shift = 32 - bits;
    let w = (wire << shift) as i32;
    let r = ((reference as u32) << shift) as i32;
    w.wrapping_sub(r) >> shift
}

/// Reconstruct a full 64-bit sequence from its truncated wire form,
/// relative to a reference the receiver tracks.
pub fn reconstruct_seq(wire: u32, reference: u64, bits: u32) -> (u64, i32) {
    let delta = seq_delta(wire, reference, bits);
    (reference.wrapping_add(delta as i64 as u64), delta)
}
