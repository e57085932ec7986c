//! Stream-flow: a flow carrying a dynamic set of streams. Owns the
//! stream-ID table (with the creator-origin bit), the priority-ordered
//! transmit queue, and the map of packets awaiting acknowledgment.

use crate::flow::Flow;
use skein_core::{Eid, Error, Result, SocketHandle, StreamHandle, StreamId};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// A transmitted (or queued-for-transmit) stream packet. The buffer holds
/// the flow header space followed by the stream header and payload; the
/// stream header is (re)built by `tx_prepare` on every transmission, since
/// a segment first sent as Init may be retransmitted as Data.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub stream: StreamHandle,
    /// Logical byte position of this segment.
    pub tsn: u64,
    pub buf: Vec<u8>,
    pub hdr_len: usize,
    pub dgram: bool,
}

/// A flow instance carrying streams.
pub struct StreamFlow {
    pub flow: Flow,
    pub peer: Eid,
    pub socket: SocketHandle,
    /// The stream with ID zero, used to multiplex service connects.
    pub root: StreamHandle,
    /// Stream-ID table, keyed by this side's view of the SID space.
    ids: HashMap<u16, StreamHandle>,
    next_sid: u16,
    /// Streams with queued segments, highest priority first; round-robin
    /// within a priority level by re-enqueueing after service.
    tx_streams: VecDeque<(StreamHandle, i32)>,
    /// Packets awaiting acknowledgment, keyed by flow sequence number.
    pub ack_wait: HashMap<u64, PacketRecord>,
}

impl StreamFlow {
    pub fn new(flow: Flow, peer: Eid, socket: SocketHandle, root: StreamHandle) -> Self {
        let mut ids = HashMap::new();
        // The root stream exists in both halves of the SID space.
        ids.insert(StreamId::ROOT.0, root);
        ids.insert(StreamId::ROOT.0 ^ StreamId::ORIGIN, root);
        Self {
            flow,
            peer,
            socket,
            root,
            ids,
            next_sid: 1,
            tx_streams: VecDeque::new(),
            ack_wait: HashMap::new(),
        }
    }

    /// Attach a stream, allocating a local SID when `sid` is `None` or
    /// recording the peer-assigned SID otherwise. Returns the SID and
    /// whether the stream starts mature (peer-created streams do: their
    /// creator has already seen our half of the round trip).
    pub fn attach(&mut self, stream: StreamHandle, sid: Option<StreamId>) -> Result<(StreamId, bool)> {
        match sid {
            None => {
                let mut sid = self.next_sid;
                while self.ids.contains_key(&sid) {
                    sid += 1;
                    if sid >= StreamId::ORIGIN {
                        sid = 1;
                    }
                    if sid == self.next_sid {
                        debug!("stream-id space exhausted");
                        return Err(Error::Exhausted("stream ids"));
                    }
                }
                self.next_sid = if sid + 1 >= StreamId::ORIGIN { 1 } else { sid + 1 };
                self.ids.insert(sid, stream);
                Ok((StreamId(sid), false))
            }
            Some(sid) => {
                debug_assert!(sid.is_peer_origin());
                self.ids.insert(sid.0, stream);
                Ok((sid, true))
            }
        }
    }

    /// Detach a stream: free its SID, scrub it from the transmit queue,
    /// and pull its unacknowledged packets out of the ack-wait map so the
    /// stream can requeue them (possibly on another flow, for migration).
    pub fn detach(&mut self, stream: StreamHandle, sid: StreamId) -> Vec<PacketRecord> {
        if self.ids.get(&sid.0) == Some(&stream) {
            self.ids.remove(&sid.0);
        }
        self.dequeue_stream(stream);

        let seqs: Vec<u64> = self
            .ack_wait
            .iter()
            .filter(|(_, p)| p.stream == stream)
            .map(|(&s, _)| s)
            .collect();
        let mut packets: Vec<PacketRecord> = seqs
            .into_iter()
            .filter_map(|s| self.ack_wait.remove(&s))
            .collect();
        packets.sort_by_key(|p| p.tsn);
        packets
    }

    pub fn stream_at(&self, sid: StreamId) -> Option<StreamHandle> {
        self.ids.get(&sid.0).copied()
    }

    /// Resolve a SID as written by the peer into our view of the space.
    pub fn stream_for_wire_sid(&self, wire_sid: u16) -> Option<StreamHandle> {
        self.stream_at(StreamId(wire_sid).flip_origin())
    }

    /// Insert a stream into the transmit queue after all streams of equal
    /// or higher priority, giving strict priority with round-robin within
    /// a level. No-op if the stream is already queued.
    pub fn enqueue_stream(&mut self, stream: StreamHandle, priority: i32) {
        if self.tx_streams.iter().any(|&(s, _)| s == stream) {
            return;
        }
        let pos = self
            .tx_streams
            .iter()
            .position(|&(_, p)| p < priority)
            .unwrap_or(self.tx_streams.len());
        self.tx_streams.insert(pos, (stream, priority));
    }

    /// Remove a stream from the transmit queue. Returns true if present.
    pub fn dequeue_stream(&mut self, stream: StreamHandle) -> bool {
        let before = self.tx_streams.len();
        self.tx_streams.retain(|&(s, _)| s != stream);
        self.tx_streams.len() != before
    }

    /// Pop the highest-priority stream with pending segments.
    pub fn pop_ready(&mut self) -> Option<(StreamHandle, i32)> {
        self.tx_streams.pop_front()
    }

    pub fn has_ready_streams(&self) -> bool {
        !self.tx_streams.is_empty()
    }

    /// All attached streams except the root, for teardown.
    pub fn attached_streams(&self) -> Vec<StreamHandle> {
        let mut v: Vec<StreamHandle> = self
            .ids
            .values()
            .copied()
            .filter(|&s| s != self.root)
            .collect();
        v.sort_unstable();
        v.dedup();
        v
    }
}
