//! Async shell around the sans-IO [`Host`]: one driver task pumps a UDP
//! socket, the host's timers, and its event queue; application handles
//! talk to the same host under a mutex and park on per-stream notifies.
//!
//! The lock is never held across an await point, so all protocol state
//! transitions still happen one at a time, exactly as the cooperative
//! model requires.

use crate::host::{Event, Host, Transmit};
use crate::stream::Shutdown;
use skein_core::{Config, Eid, Error, Result, SocketHandle, StreamHandle};
use skein_core::LinkStatus;
use skein_transport::{UdpSocket, MAX_DATAGRAM};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct Shared {
    host: Mutex<Host>,
    /// Wakes the driver when an API call produced outbound work.
    kick: Notify,
    wakers: Mutex<HashMap<StreamHandle, Arc<Notify>>>,
    accept_wakers: Mutex<HashMap<(String, String), Arc<Notify>>>,
}

impl Shared {
    fn host(&self) -> MutexGuard<'_, Host> {
        self.host.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn waker(&self, sh: StreamHandle) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().unwrap_or_else(|e| e.into_inner());
        wakers.entry(sh).or_default().clone()
    }

    fn accept_waker(&self, service: &str, protocol: &str) -> Arc<Notify> {
        let mut wakers = self.accept_wakers.lock().unwrap_or_else(|e| e.into_inner());
        wakers
            .entry((service.to_string(), protocol.to_string()))
            .or_default()
            .clone()
    }

    fn wake_stream(&self, sh: StreamHandle) {
        self.waker(sh).notify_one();
    }

    fn dispatch(&self, ev: Event) {
        match ev {
            Event::Connected(sh)
            | Event::Readable(sh)
            | Event::ReadableMessage(sh)
            | Event::ReadableDatagram(sh)
            | Event::NewSubstream(sh) => self.wake_stream(sh),
            Event::StreamFailed { stream, ref reason } => {
                debug!(%stream, reason, "stream failed");
                self.wake_stream(stream);
            }
            Event::IncomingConnection { ref service, ref protocol } => {
                self.accept_waker(service, protocol).notify_one();
            }
            Event::LinkStatusChanged { ref peer, status } => {
                debug!(%peer, %status, "link status changed");
            }
            Event::LookupRequested { ref peer } => {
                // Rendezvous is an external collaborator; the embedder
                // answers with Node::found_endpoint / lookup_failed.
                debug!(%peer, "endpoint lookup requested");
            }
        }
    }
}

async fn driver(shared: Arc<Shared>, socket: Arc<UdpSocket>, handle: SocketHandle) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        // Ship everything the host wants on the wire, then surface events.
        loop {
            let next: Option<Transmit> = shared.host().poll_transmit();
            match next {
                Some(t) => {
                    if let Err(e) = socket.send_to(&t.data, t.dest).await {
                        warn!(dest = %t.dest, error = %e, "udp send failed");
                    }
                }
                None => break,
            }
        }
        loop {
            let ev = shared.host().poll_event();
            match ev {
                Some(ev) => shared.dispatch(ev),
                None => break,
            }
        }

        let deadline = shared.host().next_timeout();
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    shared
                        .host()
                        .receive_datagram(handle, src, buf[..len].to_vec(), Instant::now());
                }
                Err(e) => warn!(error = %e, "udp recv failed"),
            },
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                shared.host().handle_timeout(Instant::now());
            }
            _ = shared.kick.notified() => {}
        }
    }
}

/// A skein endpoint bound to a UDP socket, usable from async code.
pub struct Node {
    shared: Arc<Shared>,
    local: SocketAddr,
}

impl Node {
    /// Bind a node: UDP socket, host state, and the driver task.
    pub async fn bind(cfg: Config, eid: Eid, addr: SocketAddr) -> Result<Node> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        let mut host = Host::new(cfg, eid);
        let handle = host.add_socket(local);
        let shared = Arc::new(Shared {
            host: Mutex::new(host),
            kick: Notify::new(),
            wakers: Mutex::new(HashMap::new()),
            accept_wakers: Mutex::new(HashMap::new()),
        });
        tokio::spawn(driver(shared.clone(), Arc::new(socket), handle));
        Ok(Node { shared, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Feed an endpoint hint for a peer.
    pub fn found_endpoint(&self, eid: &Eid, ep: SocketAddr) {
        self.shared.host().found_endpoint(eid, ep, Instant::now());
        self.shared.kick.notify_one();
    }

    /// Answer an outstanding lookup request.
    pub fn lookup_done(&self, eid: &Eid, ep: Option<SocketAddr>) {
        self.shared.host().lookup_done(eid, ep, Instant::now());
        self.shared.kick.notify_one();
    }

    pub fn link_status(&self, eid: &Eid) -> LinkStatus {
        self.shared.host().link_status(eid)
    }

    /// The peer roamed: re-point its flow at a new address.
    pub fn migrate_peer(&self, eid: &Eid, new_remote: SocketAddr) -> Result<()> {
        let r = self.shared.host().migrate_peer(eid, new_remote, Instant::now());
        self.shared.kick.notify_one();
        r
    }

    /// Connect to a service on a remote host and wait for the service
    /// negotiation to finish.
    pub async fn connect(
        &self,
        eid: Eid,
        service: &str,
        protocol: &str,
        hint: Option<SocketAddr>,
    ) -> Result<Stream> {
        let sh = self
            .shared
            .host()
            .connect(eid, service, protocol, hint, Instant::now())?;
        self.shared.kick.notify_one();
        let stream = Stream { shared: self.shared.clone(), handle: sh };
        stream.wait_connected().await?;
        Ok(stream)
    }

    /// Register a service and return its accept handle.
    pub fn listen(&self, service: &str, protocol: &str) -> Result<Listener> {
        self.shared.host().listen(service, protocol)?;
        Ok(Listener {
            shared: self.shared.clone(),
            service: service.to_string(),
            protocol: protocol.to_string(),
        })
    }
}

/// Accept handle for one registered (service, protocol) pair.
pub struct Listener {
    shared: Arc<Shared>,
    service: String,
    protocol: String,
}

impl Listener {
    pub async fn accept(&self) -> Stream {
        let waker = self.shared.accept_waker(&self.service, &self.protocol);
        loop {
            let notified = waker.notified();
            if let Some(sh) = self.shared.host().accept(&self.service, &self.protocol) {
                return Stream { shared: self.shared.clone(), handle: sh };
            }
            notified.await;
        }
    }
}

/// Async handle to one stream.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
    handle: StreamHandle,
}

impl Stream {
    pub fn handle(&self) -> StreamHandle {
        self.handle
    }

    fn kick(&self) {
        self.shared.kick.notify_one();
    }

    /// Wait until service negotiation completes (or fails).
    pub async fn wait_connected(&self) -> Result<()> {
        use crate::stream::StreamState::*;
        let waker = self.shared.waker(self.handle);
        loop {
            let notified = waker.notified();
            {
                let host = self.shared.host();
                match host.stream_state(self.handle) {
                    Some(Connected) => return Ok(()),
                    Some(Disconnected) => {
                        let reason = host
                            .stream_error(self.handle)
                            .unwrap_or_else(|| "disconnected".into());
                        return Err(Error::ConnectionFailed(reason));
                    }
                    None => return Err(Error::NotConnected),
                    _ => {}
                }
            }
            notified.await;
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let n = self.shared.host().write(self.handle, data, Instant::now())?;
        self.kick();
        Ok(n)
    }

    pub async fn write_message(&self, data: &[u8]) -> Result<usize> {
        let n = self
            .shared
            .host()
            .write_message(self.handle, data, Instant::now())?;
        self.kick();
        Ok(n)
    }

    /// Read up to `max` bytes, waiting for data unless the stream ended.
    pub async fn read(&self, max: usize) -> Result<Vec<u8>> {
        let waker = self.shared.waker(self.handle);
        loop {
            let notified = waker.notified();
            {
                let mut host = self.shared.host();
                if host.bytes_available(self.handle) > 0 {
                    return host.read(self.handle, max);
                }
                if host.at_end(self.handle) {
                    return Ok(Vec::new());
                }
                if host.stream_state(self.handle).is_none() {
                    return Err(Error::NotConnected);
                }
            }
            notified.await;
        }
    }

    /// Read exactly the next message, waiting for it to complete.
    pub async fn read_message(&self, max: usize) -> Result<Vec<u8>> {
        let waker = self.shared.waker(self.handle);
        loop {
            let notified = waker.notified();
            {
                let mut host = self.shared.host();
                if let Some(msg) = host.read_message(self.handle, max)? {
                    return Ok(msg);
                }
                if host.at_end(self.handle) {
                    return Err(Error::protocol("stream ended before a complete message"));
                }
            }
            notified.await;
        }
    }

    pub async fn write_datagram(&self, data: &[u8]) -> Result<()> {
        self.shared
            .host()
            .write_datagram(self.handle, data, Instant::now())?;
        self.kick();
        Ok(())
    }

    /// Receive the next datagram addressed to this stream.
    pub async fn read_datagram(&self) -> Result<Vec<u8>> {
        let waker = self.shared.waker(self.handle);
        loop {
            let notified = waker.notified();
            {
                let mut host = self.shared.host();
                if let Some(d) = host.read_datagram(self.handle)? {
                    return Ok(d);
                }
                if host.at_end(self.handle) {
                    return Err(Error::NotConnected);
                }
            }
            notified.await;
        }
    }

    /// Open a substream underneath this stream.
    pub fn open_substream(&self) -> Result<Stream> {
        let sub = self
            .shared
            .host()
            .open_substream(self.handle, Instant::now())?;
        Ok(Stream { shared: self.shared.clone(), handle: sub })
    }

    /// Accept a substream the peer opened underneath this stream.
    pub async fn accept_substream(&self) -> Result<Stream> {
        let waker = self.shared.waker(self.handle);
        loop {
            let notified = waker.notified();
            {
                let mut host = self.shared.host();
                if let Some(sub) = host.accept_substream(self.handle) {
                    return Ok(Stream { shared: self.shared.clone(), handle: sub });
                }
                if host.stream_state(self.handle).is_none() {
                    return Err(Error::NotConnected);
                }
            }
            notified.await;
        }
    }

    pub fn set_priority(&self, priority: i32) {
        self.shared.host().set_priority(self.handle, priority);
        self.kick();
    }

    pub fn bytes_available(&self) -> u64 {
        self.shared.host().bytes_available(self.handle)
    }

    pub fn at_end(&self) -> bool {
        self.shared.host().at_end(self.handle)
    }

    pub fn shutdown(&self, mode: Shutdown) {
        self.shared.host().shutdown(self.handle, mode, Instant::now());
        self.kick();
    }
}
