//! Per-stream state: the connection state machine, transmit segmentation,
//! the receive-side reorder machinery with message boundaries, datagram
//! fragmentation and reassembly, and substream bookkeeping.
//!
//! A stream never owns its flow; it holds at most a handle to the flow it
//! is currently attached to. All state that must survive migration lives
//! here, so detaching from one flow and reattaching to another loses no
//! data.

use crate::proto::{
    self, FLAG_CLOSE, FLAG_DATA_ALL, FLAG_DGRAM_BEGIN, FLAG_DGRAM_END, FLAG_MESSAGE, FLAG_PUSH,
    FLOW_HDR, HDR_DATA, HDR_DATAGRAM,
};
use crate::sflow::PacketRecord;
use bitflags::bitflags;
use skein_core::{Eid, FlowHandle, StreamHandle, StreamId};
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    /// Initiating; waiting for a flow to the peer.
    WaitFlow,
    /// Initiating; waiting for the service connect reply.
    WaitService,
    /// Accepting; waiting for the service connect request.
    Accepting,
    Connected,
}

bitflags! {
    /// Shutdown modes. `RESET` is immediate; `WRITE` is a graceful close
    /// of our direction; `READ` discards undelivered inbound data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Shutdown: u8 {
        const RESET = 0x1;
        const READ = 0x2;
        const WRITE = 0x4;
        const CLOSE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// A received segment, parked until the reader drains it. `hdr_len` is
/// the offset of the first useful payload byte (grown when a duplicate
/// prefix is merged away), `consumed` tracks reader progress within it.
#[derive(Debug, Clone)]
pub struct RxSegment {
    pub rsn: u64,
    pub buf: Vec<u8>,
    pub hdr_len: usize,
    pub consumed: usize,
}

impl RxSegment {
    pub fn size(&self) -> usize {
        self.buf.len() - self.hdr_len
    }

    pub fn flags(&self) -> u8 {
        self.buf[FLOW_HDR + 2] & FLAG_DATA_ALL
    }

    pub fn has_flags(&self) -> bool {
        self.flags() != 0
    }
}

/// State transitions of interest to the host after a segment lands.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentOutcome {
    /// Bytes became available where none were.
    pub readable: bool,
    /// A complete message became available where none was.
    pub new_message: bool,
    /// The end-of-stream marker was consumed.
    pub closed: bool,
}

/// Best-effort reassembly of a fragmented datagram. Fragments ride
/// consecutive flow sequence numbers; any gap abandons the datagram.
#[derive(Debug)]
pub struct DgramAssembly {
    next_seq: u64,
    data: Vec<u8>,
}

pub struct BaseStream {
    pub handle: StreamHandle,
    pub peer: Eid,
    pub parent: Option<StreamHandle>,
    pub state: StreamState,
    pub flow: Option<FlowHandle>,
    pub sid: StreamId,
    pub mature: bool,
    pub end_read: bool,
    pub end_write: bool,
    pub priority: i32,
    /// Keep waiting for a flow across connectivity failures.
    pub persist: bool,
    /// Carries a large datagram; self-destructs once sent and acked.
    pub ephemeral: bool,
    /// Willing to accept peer-created substreams.
    pub listening: bool,
    pub error: Option<String>,

    // Transmit state.
    pub tsn: u64,
    pub tqueue: VecDeque<PacketRecord>,
    /// Packets currently in the owning flow's ack-wait map.
    pub in_flight: usize,

    // Receive state.
    pub rsn: u64,
    pub ravail: u64,
    rmsg_avail: u64,
    pub rwin_exp: u8,
    pub peer_win_exp: u8,
    rsegs: VecDeque<RxSegment>,
    rahead: Vec<RxSegment>,
    rmsg_sizes: VecDeque<u64>,
    /// Accepted but unread substreams.
    pub rsubs: VecDeque<StreamHandle>,
    /// Reassembled stateless datagrams awaiting readers.
    pub rdgrams: VecDeque<Vec<u8>>,
    dgram_assembly: Option<DgramAssembly>,
}

impl BaseStream {
    pub fn new(handle: StreamHandle, peer: Eid, rwin_exp: u8) -> Self {
        Self {
            handle,
            peer,
            parent: None,
            state: StreamState::Disconnected,
            flow: None,
            sid: StreamId::ROOT,
            mature: false,
            end_read: false,
            end_write: false,
            priority: 0,
            persist: false,
            ephemeral: false,
            listening: false,
            error: None,
            tsn: 0,
            tqueue: VecDeque::new(),
            in_flight: 0,
            rsn: 0,
            ravail: 0,
            rmsg_avail: 0,
            rwin_exp,
            peer_win_exp: 0,
            rsegs: VecDeque::new(),
            rahead: Vec::new(),
            rmsg_sizes: VecDeque::new(),
            rsubs: VecDeque::new(),
            rdgrams: VecDeque::new(),
            dgram_assembly: None,
        }
    }

    pub fn is_link_up(&self) -> bool {
        self.state == StreamState::Connected
    }

    pub fn bytes_available(&self) -> u64 {
        self.ravail
    }

    pub fn pending_messages(&self) -> usize {
        self.rmsg_sizes.len()
    }

    pub fn pending_message_size(&self) -> Option<u64> {
        self.rmsg_sizes.front().copied()
    }

    /// Total bytes committed to complete message boundaries; never more
    /// than the bytes actually available.
    pub fn message_bytes_queued(&self) -> u64 {
        self.rmsg_sizes.iter().sum()
    }

    pub fn at_end(&self) -> bool {
        self.end_read
    }

    pub fn has_queued_data(&self) -> bool {
        !self.tqueue.is_empty()
    }

    // ----- transmit path -----

    /// Queue a packet on the stream-local transmit queue, kept in TSN
    /// order so retransmissions slot back in front of newer data.
    pub fn queue_packet(&mut self, pkt: PacketRecord) {
        let mut i = self.tqueue.len();
        while i > 0 && self.tqueue[i - 1].tsn > pkt.tsn {
            i -= 1;
        }
        self.tqueue.insert(i, pkt);
    }

    /// Split `data` into MTU-sized segments and queue them. The final
    /// segment carries `push` plus the caller's end flags (`message`
    /// for write_message, `close` for a graceful write shutdown).
    pub fn write_segments(&mut self, data: &[u8], end_flags: u8, max_payload: usize) -> usize {
        debug_assert!(!self.end_write);
        debug_assert!(max_payload > 0);
        let mut rest = data;
        let mut total = 0usize;
        loop {
            let (size, flags) = if rest.len() <= max_payload {
                (rest.len(), FLAG_PUSH | (end_flags & FLAG_DATA_ALL))
            } else {
                (max_payload, 0)
            };

            let mut buf = vec![0u8; HDR_DATA + size];
            // Stash the subtype flags where the type byte will live; the
            // major type is filled in by tx_prepare at transmit time.
            buf[FLOW_HDR + 2] = flags;
            buf[HDR_DATA..].copy_from_slice(&rest[..size]);
            let pkt = PacketRecord {
                stream: self.handle,
                tsn: self.tsn,
                buf,
                hdr_len: HDR_DATA,
                dgram: false,
            };
            self.tsn += size as u64;
            self.queue_packet(pkt);

            total += size;
            rest = &rest[size..];
            if rest.is_empty() {
                break;
            }
        }
        if end_flags & FLAG_CLOSE != 0 {
            self.end_write = true;
        }
        total
    }

    /// Queue a small datagram as begin/…/end fragments. The caller must
    /// hand the fragments to the flow back-to-back so they occupy
    /// consecutive packet sequence numbers.
    pub fn write_datagram_segments(&mut self, data: &[u8], max_payload: usize) -> usize {
        debug_assert!(self.state == StreamState::Connected);
        let mut rest = data;
        let mut first = true;
        loop {
            let size = rest.len().min(max_payload);
            let mut flags = 0u8;
            if first {
                flags |= FLAG_DGRAM_BEGIN;
            }
            if size == rest.len() {
                flags |= FLAG_DGRAM_END;
            }

            let mut buf = vec![0u8; HDR_DATAGRAM + size];
            proto::encode_datagram(
                &mut buf[FLOW_HDR..HDR_DATAGRAM],
                self.sid.0,
                flags,
                self.rwin_exp,
            );
            buf[HDR_DATAGRAM..].copy_from_slice(&rest[..size]);
            self.queue_packet(PacketRecord {
                stream: self.handle,
                tsn: self.tsn,
                buf,
                hdr_len: HDR_DATAGRAM,
                dgram: true,
            });

            rest = &rest[size..];
            first = false;
            if rest.is_empty() {
                break;
            }
        }
        data.len()
    }

    /// Fill in a queued packet's stream header for transmission on the
    /// current flow. Until a round trip is observed the stream announces
    /// itself with Init headers (parent SID + new SID, 16-bit TSN);
    /// afterwards, and for positions past the 16-bit range, it uses Data
    /// headers with the full 32-bit TSN.
    pub fn tx_prepare(&self, pkt: &mut PacketRecord, parent_sid: StreamId) {
        if pkt.dgram {
            return; // header complete since creation
        }
        let flags = pkt.buf[FLOW_HDR + 2] & FLAG_DATA_ALL;
        if self.mature || pkt.tsn > u64::from(u16::MAX) {
            proto::encode_data(
                &mut pkt.buf[FLOW_HDR..HDR_DATA],
                self.sid.0,
                flags,
                self.rwin_exp,
                pkt.tsn as u32,
            );
        } else {
            proto::encode_init(
                &mut pkt.buf[FLOW_HDR..HDR_DATA],
                proto::PacketType::Init,
                parent_sid.0,
                flags,
                self.rwin_exp,
                self.sid.0,
                pkt.tsn as u16,
            );
        }
    }

    /// A packet of ours was acknowledged. One acknowledged round trip
    /// matures the stream. Returns true when an ephemeral carrier has
    /// fully delivered its payload and should self-destruct.
    pub fn on_acked(&mut self, pkt: &PacketRecord) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        if !pkt.dgram {
            self.mature = true;
        }
        self.ephemeral && self.end_write && self.tqueue.is_empty() && self.in_flight == 0
    }

    /// A packet of ours went missing. Reliable segments requeue for
    /// retransmission; datagram fragments are simply dropped. Returns
    /// true if the stream has data to transmit again.
    pub fn on_missed(&mut self, pkt: PacketRecord) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        if pkt.dgram {
            return false;
        }
        debug!(stream = %self.handle, tsn = pkt.tsn, "segment missed, requeueing");
        self.queue_packet(pkt);
        true
    }

    // ----- receive path -----

    fn consume_in_order(&mut self, seg: RxSegment, act: u64, closed: &mut bool) {
        let flags = seg.flags();
        self.rsegs.push_back(seg);
        self.rsn += act;
        self.ravail += act;
        self.rmsg_avail += act;
        if flags & (FLAG_MESSAGE | FLAG_CLOSE) != 0 && self.rmsg_avail > 0 {
            self.rmsg_sizes.push_back(self.rmsg_avail);
            self.rmsg_avail = 0;
        }
        if flags & FLAG_CLOSE != 0 {
            *closed = true;
        }
    }

    /// Land one segment: deliver in order, merge duplicate prefixes, park
    /// out-of-order segments in the reorder list, and surface message
    /// boundaries and EOF.
    pub fn rx_segment(&mut self, mut seg: RxSegment) -> SegmentOutcome {
        let mut out = SegmentOutcome::default();
        if self.end_read {
            // Anything past end of stream (possibly forced by a read
            // shutdown on our side) is discarded.
            return out;
        }

        let seg_size = seg.size() as i64;
        let diff = seg.rsn as i64 - self.rsn as i64;
        if diff <= 0 {
            // At or before the current receive position; only the suffix
            // past our position is useful, but flag-only segments at the
            // exact position still matter.
            let act = seg_size + diff;
            if act < 0 || (act == 0 && !seg.has_flags()) {
                debug!(rsn = seg.rsn, size = seg_size, "duplicate segment dropped");
                return out;
            }
            seg.hdr_len = (seg.hdr_len as i64 - diff) as usize;

            let was_empty = self.ravail == 0;
            let was_no_msgs = self.rmsg_sizes.is_empty();
            let mut closed = false;
            self.consume_in_order(seg, act as u64, &mut closed);

            // Pull newly contiguous segments out of the reorder list.
            while let Some(first) = self.rahead.first() {
                let diff = first.rsn as i64 - self.rsn as i64;
                if diff > 0 {
                    break;
                }
                let mut seg = self.rahead.remove(0);
                let act = seg.size() as i64 + diff;
                if act < 0 || (act == 0 && !seg.has_flags()) {
                    continue;
                }
                seg.hdr_len = (seg.hdr_len as i64 - diff) as usize;
                self.consume_in_order(seg, act as u64, &mut closed);
            }

            if closed && self.ravail == 0 {
                // End of stream with nothing left to read: transition now,
                // since the reader will never dequeue the empty segment.
                self.shutdown_read();
                out.readable = true;
                out.new_message = true;
                out.closed = true;
                return out;
            }

            out.readable = was_empty && self.ravail > 0;
            out.new_message = was_no_msgs && !self.rmsg_sizes.is_empty();
            out.closed = closed;
            out
        } else {
            // Beyond the current position: park in the reorder list,
            // sorted by position. Duplicates bringing no new data or
            // flags are dropped.
            let pos = match self.rahead.binary_search_by(|s| s.rsn.cmp(&seg.rsn)) {
                Ok(i) => {
                    if seg.size() <= self.rahead[i].size() && seg.flags() == self.rahead[i].flags()
                    {
                        debug!(rsn = seg.rsn, "duplicate out-of-order segment dropped");
                        return out;
                    }
                    i
                }
                Err(i) => i,
            };
            self.rahead.insert(pos, seg);
            out
        }
    }

    /// Read up to `max` bytes of in-order data. Stops at message
    /// boundaries. `out` of `None` discards the bytes.
    pub fn read_data(&mut self, mut max: usize, mut out: Option<&mut Vec<u8>>) -> usize {
        let mut act = 0usize;
        while max > 0 && self.ravail > 0 {
            let Some(seg) = self.rsegs.front_mut() else {
                break;
            };
            let avail = seg.size() - seg.consumed;
            let take = avail.min(max);
            if let Some(dst) = out.as_deref_mut() {
                let start = seg.hdr_len + seg.consumed;
                dst.extend_from_slice(&seg.buf[start..start + take]);
            }
            seg.consumed += take;
            let seg_done = seg.consumed >= seg.size();
            let seg_flags = seg.flags();

            act += take;
            max -= take;
            self.ravail -= take as u64;

            let mut hit_boundary = false;
            if let Some(head) = self.rmsg_sizes.front_mut() {
                // Reading out of a queued message.
                *head -= take as u64;
                if *head == 0 {
                    self.rmsg_sizes.pop_front();
                    hit_boundary = true;
                }
            } else {
                self.rmsg_avail -= take as u64;
            }

            if seg_done {
                self.rsegs.pop_front();
                if seg_flags & FLAG_CLOSE != 0 {
                    self.shutdown_read();
                    return act;
                }
            }
            if hit_boundary {
                // Always stop at a message boundary.
                break;
            }
        }
        self.apply_empty_markers();
        act
    }

    /// Consume any leading zero-length segments; they exist only for
    /// their flags (a bare EOF marker, typically).
    fn apply_empty_markers(&mut self) {
        while let Some(seg) = self.rsegs.front() {
            if seg.size() > seg.consumed {
                break;
            }
            let flags = seg.flags();
            self.rsegs.pop_front();
            if flags & FLAG_CLOSE != 0 {
                self.shutdown_read();
                return;
            }
        }
    }

    /// Read the next complete message, or `None` if none is queued. If
    /// the message exceeds `max` the remainder is dropped, never bled
    /// into the next message.
    pub fn read_message(&mut self, max: usize) -> Option<Vec<u8>> {
        let msg_len = *self.rmsg_sizes.front()?;
        let want = (msg_len as usize).min(max);
        let mut buf = Vec::with_capacity(want);
        let msgs_before = self.rmsg_sizes.len();
        self.read_data(want, Some(&mut buf));
        if self.rmsg_sizes.len() == msgs_before {
            // Caller's buffer was smaller than the message: drop the rest.
            self.read_data(usize::MAX / 2, None);
        }
        Some(buf)
    }

    /// Land a datagram fragment. Single-fragment datagrams complete
    /// immediately; multi-fragment ones must arrive on consecutive
    /// packet sequence numbers or the whole datagram is abandoned.
    pub fn rx_datagram(&mut self, pkt_seq: u64, flags: u8, payload: &[u8]) -> bool {
        let begin = flags & FLAG_DGRAM_BEGIN != 0;
        let end = flags & FLAG_DGRAM_END != 0;
        match (begin, end) {
            (true, true) => {
                self.rdgrams.push_back(payload.to_vec());
                true
            }
            (true, false) => {
                self.dgram_assembly = Some(DgramAssembly {
                    next_seq: pkt_seq + 1,
                    data: payload.to_vec(),
                });
                false
            }
            (false, _) => {
                match self.dgram_assembly.take() {
                    Some(mut asm) if asm.next_seq == pkt_seq => {
                        asm.data.extend_from_slice(payload);
                        if end {
                            self.rdgrams.push_back(asm.data);
                            true
                        } else {
                            asm.next_seq += 1;
                            self.dgram_assembly = Some(asm);
                            false
                        }
                    }
                    _ => {
                        // Gap within the fragment train: drop the datagram.
                        debug!(pkt_seq, "datagram fragment gap, dropping reassembly");
                        false
                    }
                }
            }
        }
    }

    /// Pop a reassembled stateless datagram, if any.
    pub fn take_datagram(&mut self) -> Option<Vec<u8>> {
        self.rdgrams.pop_front()
    }

    // ----- shutdown -----

    /// Discard all undelivered inbound data and stop accepting more.
    pub fn shutdown_read(&mut self) {
        self.ravail = 0;
        self.rmsg_avail = 0;
        self.rsegs.clear();
        self.rahead.clear();
        self.rmsg_sizes.clear();
        self.end_read = true;
    }
}
