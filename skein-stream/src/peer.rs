//! Per-EID peer state: known endpoint candidates, outstanding lookups and
//! key-setup attempts, streams waiting for a flow, and the current
//! primary flow. A peer outlives any particular flow; the flow is just
//! the conduit currently associated with it.

use skein_core::{Eid, FlowHandle, StreamHandle};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

pub struct Peer {
    pub eid: Eid,
    /// The unique flow currently designated as the conduit to this peer.
    pub primary: Option<FlowHandle>,
    /// Candidate network locations, learned from hints and lookups.
    pub addrs: HashSet<SocketAddr>,
    /// Endpoint lookups in flight (requested, not yet answered).
    pub pending_lookups: u32,
    /// Key-setup attempts in flight, by target endpoint.
    pub initiators: HashMap<SocketAddr, u64>,
    /// Streams in WaitFlow, to be connected once a primary appears.
    pub waiting: HashSet<StreamHandle>,
    /// Reconnection retry deadline while streams are waiting.
    pub retry_at: Option<Instant>,
}

impl Peer {
    pub fn new(eid: Eid) -> Self {
        Self {
            eid,
            primary: None,
            addrs: HashSet::new(),
            pending_lookups: 0,
            initiators: HashMap::new(),
            waiting: HashSet::new(),
            retry_at: None,
        }
    }

    /// Record a candidate endpoint. Returns true if it was new.
    pub fn add_addr(&mut self, addr: SocketAddr) -> bool {
        self.addrs.insert(addr)
    }

    /// True when nothing that could produce a flow is still in progress.
    pub fn attempts_exhausted(&self) -> bool {
        self.pending_lookups == 0 && self.initiators.is_empty()
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }
}
