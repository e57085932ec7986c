//! Per-host protocol state: sockets, flows, streams, peers, listeners,
//! and the key-setup responder. Everything is owned by one [`Host`]
//! value, advanced from a single event loop; there are no process-wide
//! singletons.
//!
//! The host is sans-IO. Inbound datagrams enter through
//! [`Host::receive_datagram`]; time advances through
//! [`Host::handle_timeout`] guided by [`Host::next_timeout`]; outbound
//! datagrams and application events are drained with
//! [`Host::poll_transmit`] and [`Host::poll_event`].

use crate::flow::{AckDisposition, Flow, FlowError, FlowStats};
use crate::negotiate::{
    self, decode_control, flow_armor, ControlMsg, Initiator, KeyReply, ResponderSession,
    NONCE_LEN, SETUP_FAIL,
};
use crate::peer::Peer;
use crate::proto::{
    self, FLAG_CLOSE, FLAG_MESSAGE, FLOW_HDR, HDR_DATA, HDR_DATAGRAM, HDR_INIT, HDR_RESET,
    MAX_SERVICE_MSG,
};
use crate::sflow::StreamFlow;
use crate::stream::{BaseStream, RxSegment, SegmentOutcome, Shutdown, StreamState};
use crate::xdr::ServiceMsg;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skein_core::{
    BackoffTimer, Config, Eid, Error, FlowHandle, LinkStatus, Result, SocketHandle, StreamHandle,
    StreamId,
};
use skein_transport::{Classify, SocketTable};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// An outbound UDP datagram produced by the host.
#[derive(Debug)]
pub struct Transmit {
    pub socket: SocketHandle,
    pub dest: SocketAddr,
    pub data: Vec<u8>,
}

/// Application-visible events, drained after each host advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Service negotiation finished; the stream is usable.
    Connected(StreamHandle),
    /// Bytes became available for reading.
    Readable(StreamHandle),
    /// A complete message became available.
    ReadableMessage(StreamHandle),
    /// A datagram became available on this stream.
    ReadableDatagram(StreamHandle),
    /// The peer opened a substream under this stream.
    NewSubstream(StreamHandle),
    /// A connection landed on a registered listener.
    IncomingConnection { service: String, protocol: String },
    /// The stream failed terminally.
    StreamFailed { stream: StreamHandle, reason: String },
    /// Connectivity to a peer changed.
    LinkStatusChanged { peer: Eid, status: LinkStatus },
    /// The host wants an endpoint lookup for this peer; answer with
    /// [`Host::lookup_done`].
    LookupRequested { peer: Eid },
}

struct SocketState {
    table: SocketTable,
    local: SocketAddr,
}

pub struct Host {
    cfg: Config,
    local_eid: Eid,
    sockets: HashMap<SocketHandle, SocketState>,
    main_socket: Option<SocketHandle>,
    flows: HashMap<FlowHandle, StreamFlow>,
    streams: HashMap<StreamHandle, BaseStream>,
    peers: HashMap<Eid, Peer>,
    listeners: HashMap<(String, String), VecDeque<StreamHandle>>,
    initiators: HashMap<u64, Initiator>,
    responder_sessions: HashMap<(SocketAddr, [u8; NONCE_LEN]), ResponderSession>,
    outbox: VecDeque<Transmit>,
    events: VecDeque<Event>,
    rng: StdRng,
    next_handle: u64,
}

impl Host {
    pub fn new(cfg: Config, local_eid: Eid) -> Self {
        Self::with_rng(cfg, local_eid, StdRng::from_entropy())
    }

    /// Deterministic construction for simulations.
    pub fn with_rng(cfg: Config, local_eid: Eid, rng: StdRng) -> Self {
        Self {
            cfg,
            local_eid,
            sockets: HashMap::new(),
            main_socket: None,
            flows: HashMap::new(),
            streams: HashMap::new(),
            peers: HashMap::new(),
            listeners: HashMap::new(),
            initiators: HashMap::new(),
            responder_sessions: HashMap::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            rng,
            next_handle: 1,
        }
    }

    pub fn local_eid(&self) -> &Eid {
        &self.local_eid
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    fn alloc(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn max_payload(&self) -> usize {
        self.cfg.mtu - HDR_DATA
    }

    fn max_dgram_payload(&self) -> usize {
        self.cfg.mtu - HDR_DATAGRAM
    }

    // ----- sockets -----

    /// Register a bound socket with the host. The first one becomes the
    /// main socket used for outbound flow setup.
    pub fn add_socket(&mut self, local: SocketAddr) -> SocketHandle {
        let handle = SocketHandle(self.alloc());
        let mut table = SocketTable::new();
        // The stream protocol's control receiver (key setup).
        if let Err(e) = table.bind_receiver(proto::MAGIC) {
            debug!(error = %e, "control receiver bind");
        }
        self.sockets.insert(handle, SocketState { table, local });
        if self.main_socket.is_none() {
            self.main_socket = Some(handle);
        }
        handle
    }

    pub fn socket_addr(&self, socket: SocketHandle) -> Option<SocketAddr> {
        self.sockets.get(&socket).map(|s| s.local)
    }

    // ----- streams: lifecycle -----

    fn alloc_stream(&mut self, peer: Eid) -> StreamHandle {
        let handle = StreamHandle(self.alloc());
        let mut st = BaseStream::new(handle, peer, self.cfg.receive_window_exp);
        st.listening = true;
        self.streams.insert(handle, st);
        handle
    }

    /// Open a top-level stream to a service on a remote host. The stream
    /// is usable immediately; data queues until a flow exists and the
    /// service negotiation completes.
    pub fn connect(
        &mut self,
        eid: Eid,
        service: &str,
        protocol: &str,
        hint: Option<SocketAddr>,
        now: Instant,
    ) -> Result<StreamHandle> {
        if eid.is_empty() || service.is_empty() {
            return Err(Error::config("connect needs a peer id and a service name"));
        }
        let sh = self.alloc_stream(eid.clone());
        let request = ServiceMsg::request(service, protocol);
        let max = self.max_payload();
        if let Some(st) = self.streams.get_mut(&sh) {
            st.write_segments(&request, FLAG_MESSAGE, max);
        }

        let peer = self.peers.entry(eid.clone()).or_insert_with(|| Peer::new(eid.clone()));
        if let Some(ep) = hint {
            peer.add_addr(ep);
        }
        match peer.primary {
            Some(fh) => self.connect_to_flow(sh, fh, now)?,
            None => {
                if let Some(st) = self.streams.get_mut(&sh) {
                    st.state = StreamState::WaitFlow;
                }
                if let Some(p) = self.peers.get_mut(&eid) {
                    p.waiting.insert(sh);
                }
                self.peer_connect_flow(&eid, now);
            }
        }
        Ok(sh)
    }

    /// Mark a waiting stream as persistent: it keeps waiting for a flow
    /// across connection failures instead of failing fast.
    pub fn set_persistent(&mut self, sh: StreamHandle, persist: bool) {
        if let Some(st) = self.streams.get_mut(&sh) {
            st.persist = persist;
        }
    }

    fn connect_to_flow(&mut self, sh: StreamHandle, fh: FlowHandle, now: Instant) -> Result<()> {
        let attached = {
            let Some(sf) = self.flows.get_mut(&fh) else {
                return Err(Error::NotConnected);
            };
            let remote = sf.flow.remote();
            match sf.attach(sh, None) {
                Ok((sid, _mature)) => Ok((sid, sf.root)),
                Err(e) => Err((e, remote)),
            }
        };
        let (sid, root) = match attached {
            Ok(v) => v,
            Err((e, remote)) => {
                self.fail_stream(sh, format!("no stream IDs available while connecting to {remote}"));
                return Err(e);
            }
        };
        let priority = self.streams.get(&sh).map(|s| s.priority).unwrap_or(0);
        if let Some(st) = self.streams.get_mut(&sh) {
            st.flow = Some(fh);
            st.sid = sid;
            st.parent = Some(root);
            st.state = StreamState::WaitService;
        }
        if let Some(sf) = self.flows.get_mut(&fh) {
            sf.enqueue_stream(sh, priority);
        }
        self.pump_flow(fh, now);
        Ok(())
    }

    // ----- streams: data plane -----

    pub fn bytes_available(&self, sh: StreamHandle) -> u64 {
        self.streams.get(&sh).map(|s| s.bytes_available()).unwrap_or(0)
    }

    pub fn pending_messages(&self, sh: StreamHandle) -> usize {
        self.streams.get(&sh).map(|s| s.pending_messages()).unwrap_or(0)
    }

    pub fn at_end(&self, sh: StreamHandle) -> bool {
        self.streams.get(&sh).map(|s| s.at_end()).unwrap_or(true)
    }

    pub fn stream_state(&self, sh: StreamHandle) -> Option<StreamState> {
        self.streams.get(&sh).map(|s| s.state)
    }

    pub fn stream_error(&self, sh: StreamHandle) -> Option<String> {
        self.streams.get(&sh).and_then(|s| s.error.clone())
    }

    pub fn write(&mut self, sh: StreamHandle, data: &[u8], now: Instant) -> Result<usize> {
        self.write_on(sh, data, 0, now)
    }

    /// Write one message: the final segment carries the message boundary.
    pub fn write_message(&mut self, sh: StreamHandle, data: &[u8], now: Instant) -> Result<usize> {
        self.write_on(sh, data, FLAG_MESSAGE, now)
    }

    fn write_on(&mut self, sh: StreamHandle, data: &[u8], end_flags: u8, now: Instant) -> Result<usize> {
        let max = self.max_payload();
        let n = {
            let st = self.streams.get_mut(&sh).ok_or(Error::NotConnected)?;
            if st.end_write {
                return Err(Error::protocol("stream is shut down for writing"));
            }
            st.write_segments(data, end_flags, max)
        };
        self.kick_transmit(sh, now);
        Ok(n)
    }

    pub fn read(&mut self, sh: StreamHandle, max: usize) -> Result<Vec<u8>> {
        let st = self.streams.get_mut(&sh).ok_or(Error::NotConnected)?;
        let mut buf = Vec::new();
        st.read_data(max, Some(&mut buf));
        Ok(buf)
    }

    pub fn read_message(&mut self, sh: StreamHandle, max: usize) -> Result<Option<Vec<u8>>> {
        let st = self.streams.get_mut(&sh).ok_or(Error::NotConnected)?;
        Ok(st.read_message(max))
    }

    /// Send a best-effort datagram on this stream. Small datagrams go as
    /// stateless fragments; large ones ride an ephemeral substream that
    /// self-destructs once delivered.
    pub fn write_datagram(&mut self, sh: StreamHandle, data: &[u8], now: Instant) -> Result<()> {
        if data.len() > self.cfg.max_stateless_datagram() {
            debug!(stream = %sh, len = data.len(), "large datagram via ephemeral substream");
            let sub = self.open_substream(sh, now)?;
            if let Some(st) = self.streams.get_mut(&sub) {
                st.ephemeral = true;
            }
            self.write_on(sub, data, FLAG_CLOSE, now)?;
            return Ok(());
        }
        let max = self.max_dgram_payload();
        {
            let st = self.streams.get_mut(&sh).ok_or(Error::NotConnected)?;
            if st.state != StreamState::Connected {
                return Err(Error::NotConnected);
            }
            st.write_datagram_segments(data, max);
        }
        self.kick_transmit(sh, now);
        Ok(())
    }

    /// Receive a datagram: either a reassembled stateless one or the
    /// contents of a completed substream carrier.
    pub fn read_datagram(&mut self, sh: StreamHandle) -> Result<Option<Vec<u8>>> {
        {
            let st = self.streams.get_mut(&sh).ok_or(Error::NotConnected)?;
            if let Some(d) = st.take_datagram() {
                return Ok(Some(d));
            }
        }
        // Scan accepted substreams for one with a complete message.
        let sub = {
            let st = self.streams.get(&sh).ok_or(Error::NotConnected)?;
            st.rsubs
                .iter()
                .copied()
                .find(|s| self.streams.get(s).map(|s| s.pending_messages() > 0).unwrap_or(false))
        };
        let Some(sub) = sub else {
            return Ok(None);
        };
        if let Some(st) = self.streams.get_mut(&sh) {
            st.rsubs.retain(|&s| s != sub);
        }
        let msg = self
            .streams
            .get_mut(&sub)
            .and_then(|s| s.read_message(usize::MAX / 2));
        self.destroy_stream(sub);
        Ok(msg)
    }

    // ----- substreams -----

    /// Spawn a substream under a connected stream.
    pub fn open_substream(&mut self, sh: StreamHandle, _now: Instant) -> Result<StreamHandle> {
        let (fh, peer) = {
            let st = self.streams.get(&sh).ok_or(Error::NotConnected)?;
            if !st.is_link_up() {
                return Err(Error::NotConnected);
            }
            (st.flow.ok_or(Error::NotConnected)?, st.peer.clone())
        };
        let child = self.alloc_stream(peer);
        let sid = {
            let Some(sf) = self.flows.get_mut(&fh) else {
                return Err(Error::NotConnected);
            };
            match sf.attach(child, None) {
                Ok((sid, _)) => sid,
                Err(e) => {
                    self.streams.remove(&child);
                    return Err(e);
                }
            }
        };
        if let Some(st) = self.streams.get_mut(&child) {
            st.parent = Some(sh);
            st.flow = Some(fh);
            st.sid = sid;
            st.state = StreamState::Connected;
        }
        Ok(child)
    }

    /// Accept a substream the peer opened under `sh`.
    pub fn accept_substream(&mut self, sh: StreamHandle) -> Option<StreamHandle> {
        self.streams.get_mut(&sh)?.rsubs.pop_front()
    }

    pub fn set_priority(&mut self, sh: StreamHandle, priority: i32) {
        let Some(st) = self.streams.get_mut(&sh) else {
            return;
        };
        st.priority = priority;
        let has_data = st.has_queued_data();
        if let Some(fh) = st.flow {
            if has_data {
                if let Some(sf) = self.flows.get_mut(&fh) {
                    if sf.dequeue_stream(sh) {
                        sf.enqueue_stream(sh, priority);
                    }
                }
            }
        }
    }

    // ----- shutdown -----

    pub fn shutdown(&mut self, sh: StreamHandle, mode: Shutdown, now: Instant) {
        if mode.contains(Shutdown::RESET) {
            self.send_reset_for(sh, now);
            self.disconnect_stream(sh, None);
            return;
        }
        if mode.contains(Shutdown::READ) {
            if let Some(st) = self.streams.get_mut(&sh) {
                st.shutdown_read();
            }
        }
        if mode.contains(Shutdown::WRITE) {
            let already = self
                .streams
                .get(&sh)
                .map(|s| s.end_write)
                .unwrap_or(true);
            if !already {
                let _ = self.write_on(sh, &[], FLAG_CLOSE, now);
            }
        }
    }

    fn send_reset_for(&mut self, sh: StreamHandle, now: Instant) {
        let Some(st) = self.streams.get(&sh) else {
            return;
        };
        let (Some(fh), sid) = (st.flow, st.sid) else {
            return;
        };
        let win = st.rwin_exp;
        self.send_reset(fh, sid, win, now);
    }

    /// Emit a best-effort Reset packet naming `sid` (in our view of the
    /// space) on the given flow.
    fn send_reset(&mut self, fh: FlowHandle, sid: StreamId, win_exp: u8, now: Instant) {
        let Some(sf) = self.flows.get_mut(&fh) else {
            return;
        };
        let mut buf = vec![0u8; HDR_RESET];
        proto::encode_reset(&mut buf[FLOW_HDR..HDR_RESET], sid.0, win_exp);
        match sf.flow.flow_transmit(&mut buf, now) {
            Ok((_seq, wire)) => self.outbox.push_back(Transmit {
                socket: sf.socket,
                dest: sf.flow.remote(),
                data: wire,
            }),
            Err(e) => debug!(%fh, error = %e, "reset transmit failed"),
        }
    }

    /// Detach a stream from its flow and mark it disconnected; with an
    /// error, also surfaces a failure event.
    fn disconnect_stream(&mut self, sh: StreamHandle, error: Option<String>) {
        let Some(st) = self.streams.get(&sh) else {
            return;
        };
        match st.state {
            StreamState::Disconnected => {}
            StreamState::WaitFlow => {
                let peer = st.peer.clone();
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.waiting.remove(&sh);
                }
            }
            _ => {
                if let Some(fh) = st.flow {
                    let sid = st.sid;
                    let packets = self
                        .flows
                        .get_mut(&fh)
                        .map(|sf| sf.detach(sh, sid))
                        .unwrap_or_default();
                    if let Some(st) = self.streams.get_mut(&sh) {
                        st.flow = None;
                        st.sid = StreamId::ROOT;
                        st.in_flight = 0;
                        // Reliable in-flight segments come home; they will
                        // retransmit if the stream reattaches elsewhere.
                        for p in packets {
                            if !p.dgram {
                                st.queue_packet(p);
                            }
                        }
                    }
                }
            }
        }
        if let Some(st) = self.streams.get_mut(&sh) {
            st.state = StreamState::Disconnected;
            if let Some(reason) = error {
                st.error = Some(reason.clone());
                self.events.push_back(Event::StreamFailed { stream: sh, reason });
            }
        }
    }

    fn fail_stream(&mut self, sh: StreamHandle, reason: String) {
        debug!(stream = %sh, %reason, "stream failed");
        self.disconnect_stream(sh, Some(reason));
    }

    /// Disconnect and remove a stream outright (resets unaccepted
    /// substreams too).
    fn destroy_stream(&mut self, sh: StreamHandle) {
        self.disconnect_stream(sh, None);
        let subs: Vec<StreamHandle> = self
            .streams
            .get(&sh)
            .map(|s| s.rsubs.iter().copied().collect())
            .unwrap_or_default();
        for sub in subs {
            self.destroy_stream(sub);
        }
        self.streams.remove(&sh);
    }

    // ----- listeners -----

    /// Register a service/protocol listener.
    pub fn listen(&mut self, service: &str, protocol: &str) -> Result<()> {
        let key = (service.to_string(), protocol.to_string());
        if self.listeners.contains_key(&key) {
            return Err(Error::config(format!(
                "service '{service}' with protocol '{protocol}' already registered"
            )));
        }
        info!(service, protocol, "listening");
        self.listeners.insert(key, VecDeque::new());
        Ok(())
    }

    /// Pop an accepted connection for a listener.
    pub fn accept(&mut self, service: &str, protocol: &str) -> Option<StreamHandle> {
        self.listeners
            .get_mut(&(service.to_string(), protocol.to_string()))?
            .pop_front()
    }

    // ----- peers, lookups, migration -----

    pub fn link_status(&self, eid: &Eid) -> LinkStatus {
        self.peers
            .get(eid)
            .and_then(|p| p.primary)
            .and_then(|fh| self.flows.get(&fh))
            .map(|sf| sf.flow.link())
            .unwrap_or(LinkStatus::Down)
    }

    pub fn flow_stats(&self, eid: &Eid) -> Option<FlowStats> {
        let fh = self.peers.get(eid)?.primary?;
        Some(self.flows.get(&fh)?.flow.stats().clone())
    }

    /// Feed an endpoint hint for a peer (a location learned out of band).
    pub fn found_endpoint(&mut self, eid: &Eid, ep: SocketAddr, now: Instant) {
        let Some(peer) = self.peers.get_mut(eid) else {
            return;
        };
        if !peer.add_addr(ep) {
            return;
        }
        debug!(peer = %eid, %ep, "found endpoint");
        if peer.primary.is_none() && peer.has_waiting() {
            self.initiate(eid.clone(), ep, now);
        }
    }

    /// Answer an outstanding [`Event::LookupRequested`].
    pub fn lookup_done(&mut self, eid: &Eid, ep: Option<SocketAddr>, now: Instant) {
        if let Some(peer) = self.peers.get_mut(eid) {
            peer.pending_lookups = peer.pending_lookups.saturating_sub(1);
        }
        match ep {
            Some(ep) => self.found_endpoint(eid, ep, now),
            None => self.check_waiting(eid),
        }
    }

    /// The peer roamed: re-point its primary flow at a new remote
    /// endpoint. Streams are untouched; undelivered segments retransmit
    /// to the new address.
    pub fn migrate_peer(&mut self, eid: &Eid, new_remote: SocketAddr, now: Instant) -> Result<()> {
        let fh = {
            let peer = self.peers.get_mut(eid).ok_or(Error::NotConnected)?;
            peer.add_addr(new_remote);
            peer.primary.ok_or(Error::NotConnected)?
        };
        let (socket, old_remote, chan) = {
            let sf = self.flows.get(&fh).ok_or(Error::NotConnected)?;
            (sf.socket, sf.flow.remote(), sf.flow.local_channel())
        };
        if old_remote == new_remote {
            return Ok(());
        }
        let new_chan = self
            .sockets
            .get_mut(&socket)
            .ok_or(Error::NotConnected)?
            .table
            .rebind_flow(old_remote, chan, new_remote)?;
        if new_chan != chan {
            // The peer still names us by the old channel; without a
            // re-attach exchange this flow can only receive after the
            // peer migrates too.
            warn!(%old_remote, %new_remote, "migration changed the local channel");
        }
        if let Some(sf) = self.flows.get_mut(&fh) {
            sf.flow.set_remote(new_remote);
            sf.flow.set_local_channel(new_chan);
        }
        info!(peer = %eid, %new_remote, "flow migrated");
        self.pump_flow(fh, now);
        Ok(())
    }

    /// Kick off flow establishment for a peer: request lookups and start
    /// key setup toward every known endpoint candidate.
    fn peer_connect_flow(&mut self, eid: &Eid, now: Instant) {
        let addrs: Vec<SocketAddr> = {
            let Some(peer) = self.peers.get_mut(eid) else {
                return;
            };
            if peer.primary.is_some() {
                return;
            }
            peer.pending_lookups += 1;
            peer.retry_at = Some(now + self.cfg.connect_retry());
            peer.addrs.iter().copied().collect()
        };
        self.events.push_back(Event::LookupRequested { peer: eid.clone() });
        for addr in addrs {
            self.initiate(eid.clone(), addr, now);
        }
    }

    /// Begin a key-setup attempt toward one endpoint, unless one is
    /// already in flight there.
    fn initiate(&mut self, eid: Eid, addr: SocketAddr, now: Instant) {
        {
            let Some(peer) = self.peers.get_mut(&eid) else {
                return;
            };
            if peer.primary.is_some() || peer.initiators.contains_key(&addr) {
                return;
            }
        }
        let Some(socket) = self.main_socket else {
            warn!("no socket to initiate from");
            return;
        };
        let flow_handle = FlowHandle(self.alloc());
        let chan = {
            let Some(sock) = self.sockets.get_mut(&socket) else {
                return;
            };
            let chan = match sock.table.alloc_channel(addr) {
                Ok(c) => c,
                Err(e) => {
                    warn!(%addr, error = %e, "cannot reserve channel");
                    return;
                }
            };
            if sock.table.bind_flow(addr, chan, flow_handle).is_err() {
                return;
            }
            chan
        };

        let id = self.alloc();
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce[..]);
        let mut ini = Initiator {
            id,
            target: eid.clone(),
            socket,
            remote: addr,
            local_channel: chan,
            flow_handle,
            nonce,
            armor: self.cfg.armor,
            timer: BackoffTimer::new(self.cfg.rtt_max(), SETUP_FAIL),
        };
        ini.start(now);
        debug!(peer = %eid, %addr, "initiating key setup");
        self.outbox.push_back(Transmit {
            socket,
            dest: addr,
            data: ini.key_init(&self.local_eid),
        });
        if let Some(peer) = self.peers.get_mut(&eid) {
            peer.initiators.insert(addr, id);
        }
        self.initiators.insert(id, ini);
    }

    /// Install a freshly keyed flow as the peer's primary: cancel other
    /// setup attempts and attach every waiting stream.
    fn set_primary(&mut self, eid: &Eid, fh: FlowHandle, now: Instant) {
        let (cancelled, waiting) = {
            let Some(peer) = self.peers.get_mut(eid) else {
                return;
            };
            debug_assert!(peer.primary.is_none());
            peer.primary = Some(fh);
            peer.retry_at = None;
            let cancelled: Vec<u64> = peer.initiators.drain().map(|(_, id)| id).collect();
            let waiting: Vec<StreamHandle> = peer.waiting.drain().collect();
            (cancelled, waiting)
        };
        for id in cancelled {
            if let Some(ini) = self.initiators.remove(&id) {
                if ini.flow_handle != fh {
                    self.release_initiator_binding(&ini);
                }
            }
        }
        info!(peer = %eid, flow = %fh, "primary flow established");
        self.events.push_back(Event::LinkStatusChanged {
            peer: eid.clone(),
            status: LinkStatus::Up,
        });
        for sh in waiting {
            let _ = self.connect_to_flow(sh, fh, now);
        }
    }

    fn release_initiator_binding(&mut self, ini: &Initiator) {
        if let Some(sock) = self.sockets.get_mut(&ini.socket) {
            sock.table.unbind_flow(ini.remote, ini.local_channel);
        }
    }

    /// Fail fast the non-persistent waiting streams once every lookup and
    /// setup attempt has come up empty.
    fn check_waiting(&mut self, eid: &Eid) {
        let waiting: Vec<StreamHandle> = {
            let Some(peer) = self.peers.get(eid) else {
                return;
            };
            if peer.primary.is_some() || !peer.attempts_exhausted() {
                return;
            }
            peer.waiting.iter().copied().collect()
        };
        for sh in waiting {
            let persist = self.streams.get(&sh).map(|s| s.persist).unwrap_or(false);
            if persist {
                continue;
            }
            if let Some(peer) = self.peers.get_mut(eid) {
                peer.waiting.remove(&sh);
            }
            self.fail_stream(sh, format!("cannot establish connection to host {eid}"));
        }
    }

    // ----- inbound -----

    /// Entry point for one UDP datagram received on a registered socket.
    pub fn receive_datagram(
        &mut self,
        socket: SocketHandle,
        src: SocketAddr,
        data: Vec<u8>,
        now: Instant,
    ) {
        let Some(sock) = self.sockets.get(&socket) else {
            return;
        };
        match sock.table.classify(src, &data) {
            Classify::Flow(fh) => self.flow_receive(fh, data, now),
            Classify::Control(_) => self.control_receive(socket, src, &data, now),
            Classify::Drop => {}
        }
    }

    fn flow_receive(&mut self, fh: FlowHandle, data: Vec<u8>, now: Instant) {
        let rx = {
            let Some(sf) = self.flows.get_mut(&fh) else {
                debug!(%fh, "datagram for half-set-up flow dropped");
                return;
            };
            match sf.flow.receive(data, now) {
                Ok(rx) => rx,
                Err(_) => return,
            }
        };
        if rx.link_became_up {
            if let Some(peer) = self.flows.get(&fh).map(|sf| sf.peer.clone()) {
                self.events.push_back(Event::LinkStatusChanged {
                    peer,
                    status: LinkStatus::Up,
                });
            }
        }

        // Acknowledgment effects fire before anything the payload can
        // make application-visible.
        for seq in &rx.missed {
            self.packet_missed(fh, *seq, now);
        }
        for seq in &rx.acked {
            self.packet_acked(fh, *seq, now);
        }

        let is_data = rx.pkt.len() > FLOW_HDR;
        if is_data {
            self.stream_receive(fh, rx.pkt_seq, rx.pkt, now);
        }

        if let Some(sf) = self.flows.get_mut(&fh) {
            if sf.flow.received(rx.pkt_seq, is_data, now) == AckDisposition::Immediate {
                if let Ok((_seq, wire)) = sf.flow.transmit_ack(now) {
                    self.outbox.push_back(Transmit {
                        socket: sf.socket,
                        dest: sf.flow.remote(),
                        data: wire,
                    });
                }
            }
        }

        if rx.new_packets > 0 {
            self.pump_flow(fh, now);
        }
    }

    fn packet_acked(&mut self, fh: FlowHandle, seq: u64, now: Instant) {
        let Some(pkt) = self.flows.get_mut(&fh).and_then(|sf| sf.ack_wait.remove(&seq)) else {
            return;
        };
        let sh = pkt.stream;
        let destroy = self
            .streams
            .get_mut(&sh)
            .map(|st| st.on_acked(&pkt))
            .unwrap_or(false);
        if destroy {
            debug!(stream = %sh, "ephemeral substream delivered, destroying");
            self.destroy_stream(sh);
        }
    }

    fn packet_missed(&mut self, fh: FlowHandle, seq: u64, _now: Instant) {
        let Some(pkt) = self.flows.get_mut(&fh).and_then(|sf| sf.ack_wait.remove(&seq)) else {
            return;
        };
        let sh = pkt.stream;
        let (requeue, priority) = match self.streams.get_mut(&sh) {
            Some(st) => (st.on_missed(pkt), st.priority),
            None => return,
        };
        if requeue {
            if let Some(sf) = self.flows.get_mut(&fh) {
                sf.enqueue_stream(sh, priority);
            }
        }
    }

    /// Demultiplex a decrypted packet to its stream by the 4-bit type.
    fn stream_receive(&mut self, fh: FlowHandle, pkt_seq: u64, pkt: Vec<u8>, now: Instant) {
        if pkt.len() < FLOW_HDR + 4 {
            debug!("stream rx: runt packet");
            return;
        }
        let Ok((rest, hdr)) = proto::parse_stream_header(&pkt[FLOW_HDR..]) else {
            debug!("stream rx: unparseable header");
            return;
        };
        let target = self
            .flows
            .get(&fh)
            .and_then(|sf| sf.stream_for_wire_sid(hdr.sid));

        match hdr.ptype {
            proto::PacketType::Init => {
                if pkt.len() < HDR_INIT {
                    debug!("stream rx: runt init");
                    return;
                }
                let Ok((_, (nsid_wire, tsn16))) = proto::parse_init_fields(rest) else {
                    return;
                };
                let Some(parent) = target else {
                    debug!(sid = hdr.sid, "init for unknown parent stream");
                    return;
                };
                self.rx_init(fh, parent, nsid_wire, tsn16, hdr.win_exp, pkt, now);
            }
            proto::PacketType::Data => {
                if pkt.len() < HDR_DATA {
                    debug!("stream rx: runt data");
                    return;
                }
                let Ok((_, tsn32)) = proto::parse_data_fields(rest) else {
                    return;
                };
                match target {
                    Some(sh) => self.rx_data(sh, tsn32, hdr.win_exp, pkt, now),
                    // May simply be a Data segment racing ahead of its
                    // stream's Init; the retransmission will land once
                    // the stream exists.
                    None => debug!(sid = hdr.sid, "data for unknown stream dropped"),
                }
            }
            proto::PacketType::Datagram => match target {
                Some(sh) => self.rx_datagram_packet(sh, pkt_seq, hdr.flags, &pkt, now),
                None => debug!(sid = hdr.sid, "datagram for unknown stream"),
            },
            proto::PacketType::Reset => {
                if let Some(sh) = target {
                    self.fail_stream(sh, "stream reset by peer".into());
                }
            }
            proto::PacketType::Reply | proto::PacketType::Attach | proto::PacketType::Detach => {
                debug!(ptype = ?hdr.ptype, "unhandled stream packet type");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rx_init(
        &mut self,
        fh: FlowHandle,
        parent: StreamHandle,
        nsid_wire: u16,
        tsn16: u16,
        win_exp: u8,
        pkt: Vec<u8>,
        now: Instant,
    ) {
        let nsid = StreamId(nsid_wire).flip_origin();
        if !nsid.is_peer_origin() {
            warn!(%nsid, "peer tried to create a stream in our half of the SID space");
            return;
        }

        let existing = self.flows.get(&fh).and_then(|sf| sf.stream_at(nsid));
        let child = match existing {
            Some(c) => {
                if self.streams.get(&c).and_then(|s| s.parent) != Some(parent) {
                    warn!(%nsid, "init with mismatched parent/child relationship");
                    return;
                }
                c
            }
            None => {
                let (listening, peer, parent_is_root) = {
                    let Some(p) = self.streams.get(&parent) else {
                        return;
                    };
                    let root = self.flows.get(&fh).map(|sf| sf.root);
                    (p.listening, p.peer.clone(), root == Some(parent))
                };
                if !listening {
                    debug!("peer opened a substream but we are not listening");
                    return;
                }
                let c = self.alloc_stream(peer);
                if let Some(sf) = self.flows.get_mut(&fh) {
                    if sf.attach(c, Some(nsid)).is_err() {
                        self.streams.remove(&c);
                        return;
                    }
                }
                if let Some(st) = self.streams.get_mut(&c) {
                    st.parent = Some(parent);
                    st.flow = Some(fh);
                    st.sid = nsid;
                    st.mature = true;
                    st.state = if parent_is_root {
                        // A service request is expected first.
                        StreamState::Accepting
                    } else {
                        StreamState::Connected
                    };
                }
                if !parent_is_root {
                    if let Some(p) = self.streams.get_mut(&parent) {
                        p.rsubs.push_back(c);
                    }
                    self.events.push_back(Event::NewSubstream(parent));
                }
                c
            }
        };

        let out = {
            let Some(st) = self.streams.get_mut(&child) else {
                return;
            };
            st.peer_win_exp = win_exp;
            st.rx_segment(RxSegment {
                rsn: u64::from(tsn16),
                buf: pkt,
                hdr_len: HDR_INIT,
                consumed: 0,
            })
        };
        self.apply_segment_outcome(child, out, now);
    }

    fn rx_data(&mut self, sh: StreamHandle, tsn32: u32, win_exp: u8, pkt: Vec<u8>, now: Instant) {
        let out = {
            let Some(st) = self.streams.get_mut(&sh) else {
                return;
            };
            st.peer_win_exp = win_exp;
            let (rsn, _) = proto::reconstruct_seq(tsn32, st.rsn, 32);
            st.rx_segment(RxSegment {
                rsn,
                buf: pkt,
                hdr_len: HDR_DATA,
                consumed: 0,
            })
        };
        self.apply_segment_outcome(sh, out, now);
    }

    fn rx_datagram_packet(
        &mut self,
        sh: StreamHandle,
        pkt_seq: u64,
        flags: u8,
        pkt: &[u8],
        _now: Instant,
    ) {
        let completed = {
            let Some(st) = self.streams.get_mut(&sh) else {
                return;
            };
            if st.state != StreamState::Connected {
                return;
            }
            st.rx_datagram(pkt_seq, flags, &pkt[HDR_DATAGRAM..])
        };
        if completed {
            self.events.push_back(Event::ReadableDatagram(sh));
        }
    }

    fn apply_segment_outcome(&mut self, sh: StreamHandle, out: SegmentOutcome, now: Instant) {
        let Some(st) = self.streams.get(&sh) else {
            return;
        };
        match st.state {
            StreamState::Connected => {
                if out.readable {
                    self.events.push_back(Event::Readable(sh));
                }
                if out.new_message {
                    self.events.push_back(Event::ReadableMessage(sh));
                    // Substream-borne datagrams surface on the parent.
                    if let Some(parent) = st.parent {
                        let is_carrier = self
                            .streams
                            .get(&parent)
                            .map(|p| p.rsubs.contains(&sh))
                            .unwrap_or(false);
                        if is_carrier {
                            self.events.push_back(Event::ReadableDatagram(parent));
                        }
                    }
                }
            }
            StreamState::WaitService => {
                if out.new_message {
                    self.got_service_reply(sh, now);
                }
            }
            StreamState::Accepting => {
                if out.new_message {
                    self.got_service_request(sh, now);
                }
            }
            _ => {}
        }
    }

    // ----- service negotiation -----

    fn got_service_reply(&mut self, sh: StreamHandle, _now: Instant) {
        let msg = self
            .streams
            .get_mut(&sh)
            .and_then(|st| st.read_message(MAX_SERVICE_MSG));
        let Some(msg) = msg else {
            return;
        };
        match ServiceMsg::decode(&msg) {
            Ok(ServiceMsg::ConnectReply { err: 0, .. }) => {
                if let Some(st) = self.streams.get_mut(&sh) {
                    st.state = StreamState::Connected;
                }
                self.events.push_back(Event::Connected(sh));
            }
            Ok(ServiceMsg::ConnectReply { code, err }) => {
                self.fail_stream(sh, format!("service connect failed: {code:#x} {err}"));
            }
            _ => self.fail_stream(sh, "malformed service reply".into()),
        }
    }

    fn got_service_request(&mut self, sh: StreamHandle, now: Instant) {
        let msg = self
            .streams
            .get_mut(&sh)
            .and_then(|st| st.read_message(MAX_SERVICE_MSG));
        let Some(msg) = msg else {
            return;
        };
        match ServiceMsg::decode(&msg) {
            Ok(ServiceMsg::ConnectRequest { service, protocol }) => {
                let key = (service.clone(), protocol.clone());
                let max = self.max_payload();
                if self.listeners.contains_key(&key) {
                    if let Some(st) = self.streams.get_mut(&sh) {
                        st.write_segments(&ServiceMsg::reply(0), FLAG_MESSAGE, max);
                        st.state = StreamState::Connected;
                    }
                    if let Some(backlog) = self.listeners.get_mut(&key) {
                        backlog.push_back(sh);
                    }
                    self.events.push_back(Event::IncomingConnection { service, protocol });
                } else {
                    warn!(service, protocol, "connect request for unregistered service");
                    if let Some(st) = self.streams.get_mut(&sh) {
                        // Deliver the refusal, then close; the carrier
                        // destroys itself once the reply is acked.
                        st.write_segments(&ServiceMsg::reply(1), FLAG_MESSAGE | FLAG_CLOSE, max);
                        st.state = StreamState::Connected;
                        st.ephemeral = true;
                    }
                }
                self.kick_transmit(sh, now);
            }
            _ => self.fail_stream(sh, "malformed service request".into()),
        }
    }

    // ----- control (key setup) -----

    fn control_receive(&mut self, socket: SocketHandle, src: SocketAddr, data: &[u8], now: Instant) {
        match decode_control(data) {
            Ok(ControlMsg::KeyInit(ki)) => self.handle_key_init(socket, src, ki, now),
            Ok(ControlMsg::KeyReply(kr)) => self.handle_key_reply(src, kr, now),
            Err(e) => debug!(%src, error = %e, "bad control packet"),
        }
    }

    fn handle_key_init(
        &mut self,
        socket: SocketHandle,
        src: SocketAddr,
        ki: negotiate::KeyInit,
        now: Instant,
    ) {
        if ki.target != self.local_eid {
            debug!(%src, "key init addressed to a different host");
            return;
        }
        // Simultaneous setup: when both sides dial each other, the side
        // with the greater identity keeps initiating and ignores the
        // peer's init, so exactly one flow pair survives.
        let dueling = self
            .peers
            .get(&ki.initiator)
            .map(|p| p.primary.is_none() && !p.initiators.is_empty())
            .unwrap_or(false);
        if dueling && self.local_eid > ki.initiator {
            debug!(peer = %ki.initiator, "simultaneous key setup, deferring to our initiation");
            return;
        }
        let session_key = (src, ki.nonce);
        if let Some(sess) = self.responder_sessions.get(&session_key) {
            // Retransmitted init: repeat the identical reply.
            let reply = KeyReply {
                responder: self.local_eid.clone(),
                nonce_init: ki.nonce,
                nonce_resp: sess.nonce_resp,
                channel: sess.channel,
            };
            self.outbox.push_back(Transmit { socket, dest: src, data: reply.encode() });
            return;
        }

        let fh = FlowHandle(self.alloc());
        let chan = {
            let Some(sock) = self.sockets.get_mut(&socket) else {
                return;
            };
            let chan = match sock.table.alloc_channel(src) {
                Ok(c) => c,
                Err(e) => {
                    warn!(%src, error = %e, "responder cannot allocate channel");
                    return;
                }
            };
            if sock.table.bind_flow(src, chan, fh).is_err() {
                return;
            }
            chan
        };

        let mut nonce_resp = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_resp[..]);
        let armor = flow_armor(ki.armor, &ki.initiator, &self.local_eid, &ki.nonce, &nonce_resp, false);
        let mut flow = Flow::new(&self.cfg, src, chan, ki.channel, armor, now);
        flow.start();

        let root = self.alloc_stream(ki.initiator.clone());
        if let Some(st) = self.streams.get_mut(&root) {
            st.state = StreamState::Connected;
            st.flow = Some(fh);
            st.mature = true;
        }
        let sf = StreamFlow::new(flow, ki.initiator.clone(), socket, root);
        self.flows.insert(fh, sf);
        debug!(peer = %ki.initiator, %src, %fh, "accepted key setup");

        let peer = self
            .peers
            .entry(ki.initiator.clone())
            .or_insert_with(|| Peer::new(ki.initiator.clone()));
        peer.add_addr(src);
        let install = peer.primary.is_none();
        if install {
            self.set_primary(&ki.initiator.clone(), fh, now);
        }

        self.responder_sessions.insert(
            session_key,
            ResponderSession { flow: fh, nonce_resp, channel: chan },
        );
        let reply = KeyReply {
            responder: self.local_eid.clone(),
            nonce_init: ki.nonce,
            nonce_resp,
            channel: chan,
        };
        self.outbox.push_back(Transmit { socket, dest: src, data: reply.encode() });
    }

    fn handle_key_reply(&mut self, src: SocketAddr, kr: KeyReply, now: Instant) {
        let found = self
            .initiators
            .iter()
            .find(|(_, i)| i.remote == src && i.nonce == kr.nonce_init)
            .map(|(&id, _)| id);
        let Some(id) = found else {
            debug!(%src, "stale or unknown key reply");
            return;
        };
        if self.initiators[&id].target != kr.responder {
            debug!(%src, "key reply from unexpected responder identity");
            return;
        }
        let Some(ini) = self.initiators.remove(&id) else {
            return;
        };
        let eid = ini.target.clone();
        if let Some(peer) = self.peers.get_mut(&eid) {
            peer.initiators.remove(&ini.remote);
        }

        if self
            .peers
            .get(&eid)
            .map(|p| p.primary.is_some())
            .unwrap_or(false)
        {
            // A primary appeared meanwhile (e.g. the peer dialed us);
            // this spare setup is abandoned.
            self.release_initiator_binding(&ini);
            return;
        }

        let armor = flow_armor(ini.armor, &self.local_eid, &eid, &ini.nonce, &kr.nonce_resp, true);
        let mut flow = Flow::new(&self.cfg, src, ini.local_channel, kr.channel, armor, now);
        flow.start();
        let root = self.alloc_stream(eid.clone());
        if let Some(st) = self.streams.get_mut(&root) {
            st.state = StreamState::Connected;
            st.flow = Some(ini.flow_handle);
            st.mature = true;
        }
        let sf = StreamFlow::new(flow, eid.clone(), ini.socket, root);
        self.flows.insert(ini.flow_handle, sf);
        debug!(peer = %eid, %src, flow = %ini.flow_handle, "key setup completed");
        self.set_primary(&eid, ini.flow_handle, now);
    }

    // ----- transmit pump -----

    /// If the stream has queued segments and an active flow, make sure it
    /// is scheduled and drive the flow's transmit loop.
    fn kick_transmit(&mut self, sh: StreamHandle, now: Instant) {
        let Some(st) = self.streams.get(&sh) else {
            return;
        };
        if !st.has_queued_data() {
            return;
        }
        match st.state {
            StreamState::Disconnected | StreamState::WaitFlow => return,
            _ => {}
        }
        let (Some(fh), priority) = (st.flow, st.priority) else {
            return;
        };
        if let Some(sf) = self.flows.get_mut(&fh) {
            sf.enqueue_stream(sh, priority);
        }
        self.pump_flow(fh, now);
    }

    /// The flow-side transmit loop: while the congestion window permits
    /// and streams have queued segments, pop the highest-priority stream,
    /// prepare and send one segment, and round-robin it back. Datagram
    /// fragment trains are sent back to back so their packet sequence
    /// numbers stay consecutive.
    fn pump_flow(&mut self, fh: FlowHandle, now: Instant) {
        loop {
            let ready = {
                let Some(sf) = self.flows.get_mut(&fh) else {
                    return;
                };
                if !sf.flow.is_active() || sf.flow.may_transmit() == 0 {
                    return;
                }
                sf.pop_ready()
            };
            let Some((sh, priority)) = ready else {
                return;
            };

            let mut in_dgram_train = true;
            while in_dgram_train {
                // Pop the stream's next queued segment.
                let Some(mut pkt) = self
                    .streams
                    .get_mut(&sh)
                    .and_then(|st| st.tqueue.pop_front())
                else {
                    break;
                };

                // Fill in the stream header for this transmission.
                let parent_sid = self
                    .streams
                    .get(&sh)
                    .and_then(|st| st.parent)
                    .and_then(|p| self.streams.get(&p))
                    .map(|p| p.sid)
                    .unwrap_or(StreamId::ROOT);
                if let Some(st) = self.streams.get(&sh) {
                    st.tx_prepare(&mut pkt, parent_sid);
                }

                in_dgram_train = pkt.dgram && pkt.buf[FLOW_HDR + 2] & proto::FLAG_DGRAM_END == 0;

                let sent = {
                    let Some(sf) = self.flows.get_mut(&fh) else {
                        return;
                    };
                    match sf.flow.flow_transmit(&mut pkt.buf, now) {
                        Ok((seq, wire)) => {
                            self.outbox.push_back(Transmit {
                                socket: sf.socket,
                                dest: sf.flow.remote(),
                                data: wire,
                            });
                            if pkt.dgram {
                                // Fire and forget: no retransmission.
                                pkt.buf = Vec::new();
                            }
                            sf.ack_wait.insert(seq, pkt);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                };
                match sent {
                    Ok(()) => {}
                    Err(FlowError::Inactive) => return,
                    Err(FlowError::SeqExhausted) => {
                        self.flow_failed(fh, "packet sequence space exhausted", now);
                        return;
                    }
                }
                if let Some(st) = self.streams.get_mut(&sh) {
                    st.in_flight += 1;
                }
            }

            let more = self
                .streams
                .get(&sh)
                .map(|st| st.has_queued_data())
                .unwrap_or(false);
            if more {
                if let Some(sf) = self.flows.get_mut(&fh) {
                    sf.enqueue_stream(sh, priority);
                }
            }
        }
    }

    // ----- flow failure -----

    /// Terminal flow failure: detach and fail every attached stream,
    /// clear the peer's primary pointer, and dismantle the flow.
    fn flow_failed(&mut self, fh: FlowHandle, reason: &str, now: Instant) {
        let Some(mut sf) = self.flows.remove(&fh) else {
            return;
        };
        sf.flow.stop();
        warn!(%fh, peer = %sf.peer, reason, "flow failed");

        if let Some(sock) = self.sockets.get_mut(&sf.socket) {
            for (ep, ch) in sock.table.bindings_of(fh) {
                sock.table.unbind_flow(ep, ch);
            }
        }
        self.responder_sessions.retain(|_, s| s.flow != fh);

        let eid = sf.peer.clone();
        if let Some(peer) = self.peers.get_mut(&eid) {
            if peer.primary == Some(fh) {
                peer.primary = None;
                self.events.push_back(Event::LinkStatusChanged {
                    peer: eid.clone(),
                    status: LinkStatus::Down,
                });
            }
        }

        let remote = sf.flow.remote();
        for sh in sf.attached_streams() {
            if let Some(st) = self.streams.get_mut(&sh) {
                st.flow = None;
                st.sid = StreamId::ROOT;
                st.in_flight = 0;
                st.state = StreamState::Disconnected;
                let reason = format!("connection to host {eid} at {remote} failed: {reason}");
                st.error = Some(reason.clone());
                self.events.push_back(Event::StreamFailed { stream: sh, reason });
            }
        }
        self.streams.remove(&sf.root);
    }

    // ----- timers -----

    /// Earliest deadline across all timers the host owns.
    pub fn next_timeout(&self) -> Option<Instant> {
        let flows = self.flows.values().filter_map(|sf| sf.flow.next_timeout());
        let setups = self.initiators.values().filter_map(|i| i.timer.deadline());
        let retries = self.peers.values().filter_map(|p| p.retry_at);
        flows.chain(setups).chain(retries).min()
    }

    /// Fire every timer whose deadline has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        // Flow retransmission and delayed-ACK timers.
        let fhs: Vec<FlowHandle> = self.flows.keys().copied().collect();
        for fh in fhs {
            let (rtx, ack_due) = {
                let Some(sf) = self.flows.get_mut(&fh) else {
                    continue;
                };
                (sf.flow.poll_rtx(now), sf.flow.ack_due(now))
            };
            if let Some(out) = rtx {
                if out.failed {
                    self.flow_failed(fh, "retransmission ceiling exceeded", now);
                    continue;
                }
                if let Some((from, to)) = out.missed_range {
                    for seq in from..=to {
                        self.packet_missed(fh, seq, now);
                    }
                }
                // Force progress even at the collapsed window.
                self.pump_flow(fh, now);
            }
            if ack_due {
                if let Some(sf) = self.flows.get_mut(&fh) {
                    if let Ok((_seq, wire)) = sf.flow.transmit_ack(now) {
                        self.outbox.push_back(Transmit {
                            socket: sf.socket,
                            dest: sf.flow.remote(),
                            data: wire,
                        });
                    }
                }
            }
        }

        // Key-setup retransmissions.
        let ids: Vec<u64> = self.initiators.keys().copied().collect();
        for id in ids {
            let expired = {
                let Some(ini) = self.initiators.get_mut(&id) else {
                    continue;
                };
                ini.timer.poll(now)
            };
            match expired {
                Some(true) => {
                    if let Some(ini) = self.initiators.remove(&id) {
                        debug!(peer = %ini.target, remote = %ini.remote, "key setup abandoned");
                        self.release_initiator_binding(&ini);
                        let eid = ini.target.clone();
                        if let Some(peer) = self.peers.get_mut(&eid) {
                            peer.initiators.remove(&ini.remote);
                        }
                        self.check_waiting(&eid);
                    }
                }
                Some(false) => {
                    let resend = {
                        let Some(ini) = self.initiators.get_mut(&id) else {
                            continue;
                        };
                        ini.timer.restart(now);
                        Transmit {
                            socket: ini.socket,
                            dest: ini.remote,
                            data: ini.key_init(&self.local_eid),
                        }
                    };
                    self.outbox.push_back(resend);
                }
                None => {}
            }
        }

        // Peer reconnection retries.
        let eids: Vec<Eid> = self.peers.keys().cloned().collect();
        for eid in eids {
            let due = {
                let Some(peer) = self.peers.get_mut(&eid) else {
                    continue;
                };
                if peer.retry_at.is_some_and(|t| t <= now) {
                    peer.retry_at = None;
                    true
                } else {
                    false
                }
            };
            if !due {
                continue;
            }
            let has_primary = self.peers.get(&eid).and_then(|p| p.primary).is_some();
            if has_primary {
                continue;
            }
            // Unanswered lookups from the previous round are presumed dead.
            if let Some(peer) = self.peers.get_mut(&eid) {
                peer.pending_lookups = 0;
            }
            self.check_waiting(&eid);
            let still_waiting = self.peers.get(&eid).map(|p| p.has_waiting()).unwrap_or(false);
            if still_waiting {
                self.peer_connect_flow(&eid, now);
            }
        }
    }

    // ----- pumps -----

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}
