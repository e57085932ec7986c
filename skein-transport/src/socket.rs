use skein_core::{Channel, Error, FlowHandle, Result};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Largest magic value a control receiver may register. The top byte of a
/// control packet's first word must be zero so it can never be mistaken
/// for flow traffic on a non-zero channel.
pub const MAGIC_MAX: u32 = 0x00ff_ffff;

/// Where an inbound datagram should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classify {
    /// A flow bound at (source, channel).
    Flow(FlowHandle),
    /// A control receiver bound to this magic.
    Control(u32),
    /// Nothing registered; drop.
    Drop,
}

/// Per-socket dispatch state: the flow table keyed by remote endpoint and
/// local channel, and the control-receiver table keyed by magic.
#[derive(Debug, Default)]
pub struct SocketTable {
    flows: HashMap<(SocketAddr, Channel), FlowHandle>,
    receivers: HashSet<u32>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an unused channel for a new outbound flow to `remote`.
    /// Channel zero is never assigned; it belongs to control traffic.
    pub fn alloc_channel(&self, remote: SocketAddr) -> Result<Channel> {
        for chan in 1..=u8::MAX {
            let chan = Channel(chan);
            if !self.flows.contains_key(&(remote, chan)) {
                return Ok(chan);
            }
        }
        Err(Error::Exhausted("channels"))
    }

    /// Register a flow at (remote, channel).
    pub fn bind_flow(&mut self, remote: SocketAddr, chan: Channel, flow: FlowHandle) -> Result<()> {
        if chan.is_control() {
            return Err(Error::protocol("cannot bind a flow on the control channel"));
        }
        match self.flows.entry((remote, chan)) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(Error::protocol(format!("channel {chan} to {remote} already bound")))
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(flow);
                Ok(())
            }
        }
    }

    pub fn unbind_flow(&mut self, remote: SocketAddr, chan: Channel) -> Option<FlowHandle> {
        self.flows.remove(&(remote, chan))
    }

    /// Move an existing binding to a new remote endpoint (peer migration).
    /// Keeps the channel when it is free at the new endpoint, otherwise
    /// allocates a fresh one. Streams are untouched; only the conduit's
    /// address changes.
    pub fn rebind_flow(
        &mut self,
        old_remote: SocketAddr,
        chan: Channel,
        new_remote: SocketAddr,
    ) -> Result<Channel> {
        let flow = self
            .flows
            .remove(&(old_remote, chan))
            .ok_or_else(|| Error::protocol("rebind of unbound flow"))?;
        let new_chan = if self.flows.contains_key(&(new_remote, chan)) {
            match self.alloc_channel(new_remote) {
                Ok(c) => c,
                Err(e) => {
                    // Restore the old binding rather than losing the flow.
                    self.flows.insert((old_remote, chan), flow);
                    return Err(e);
                }
            }
        } else {
            chan
        };
        self.flows.insert((new_remote, new_chan), flow);
        Ok(new_chan)
    }

    pub fn flow_at(&self, remote: SocketAddr, chan: Channel) -> Option<FlowHandle> {
        self.flows.get(&(remote, chan)).copied()
    }

    /// Register a control receiver for a magic value.
    pub fn bind_receiver(&mut self, magic: u32) -> Result<()> {
        if magic > MAGIC_MAX {
            return Err(Error::protocol("control magic must leave the top byte zero"));
        }
        if !self.receivers.insert(magic) {
            return Err(Error::protocol(format!("receiver magic {magic:#010x} already bound")));
        }
        Ok(())
    }

    pub fn unbind_receiver(&mut self, magic: u32) {
        self.receivers.remove(&magic);
    }

    /// Classify an inbound datagram by its first bytes.
    pub fn classify(&self, src: SocketAddr, data: &[u8]) -> Classify {
        if data.len() < 4 {
            debug!(%src, len = data.len(), "ignoring runt datagram");
            return Classify::Drop;
        }
        let chan = Channel(data[0]);
        if !chan.is_control() {
            if let Some(flow) = self.flow_at(src, chan) {
                return Classify::Flow(flow);
            }
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if self.receivers.contains(&magic) {
            return Classify::Control(magic);
        }
        warn!(%src, magic = format_args!("{magic:#010x}"), "datagram for unknown flow/receiver");
        Classify::Drop
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Bindings for a given flow handle, used at teardown.
    pub fn bindings_of(&self, flow: FlowHandle) -> Vec<(SocketAddr, Channel)> {
        self.flows
            .iter()
            .filter(|(_, &fh)| fh == flow)
            .map(|(&k, _)| k)
            .collect()
    }
}
