#![forbid(unsafe_code)]

//! Deterministic multi-host network simulator for integration tests:
//! virtual clock, per-link loss and latency, FIFO delivery, and a
//! one-shot targeted packet drop for loss-recovery scenarios.
//!
//! The simulator drives the sans-IO protocol hosts directly; no real
//! sockets or timers are involved, so every run is reproducible from its
//! seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skein_core::{Config, Eid, SocketHandle, StreamHandle};
use skein_stream::host::{Event, Host};
use skein_stream::stream::StreamState;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Per-direction link behavior applied to every simulated datagram.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Probability a datagram disappears in flight.
    pub loss: f64,
    /// One-way delivery delay.
    pub latency: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { loss: 0.0, latency: Duration::from_millis(10) }
    }
}

struct Delivery {
    at: Instant,
    id: u64,
    to: usize,
    src: SocketAddr,
    data: Vec<u8>,
}

impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}
impl Eq for Delivery {}
impl PartialOrd for Delivery {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delivery {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.id).cmp(&(other.at, other.id))
    }
}

pub struct SimNet {
    hosts: Vec<Host>,
    addrs: Vec<SocketAddr>,
    socks: Vec<SocketHandle>,
    link: LinkConfig,
    rng: StdRng,
    start: Instant,
    now: Instant,
    heap: BinaryHeap<Reverse<Delivery>>,
    next_id: u64,
    /// One-shot targeted drop: skip the n-th upcoming datagram sent by
    /// the given host (0-based), once.
    drop_one_after: Option<(usize, u64)>,
    /// Virtual time at which the targeted drop happened.
    pub dropped_at: Option<Instant>,
}

impl SimNet {
    pub fn new(n: usize, link: LinkConfig, seed: u64) -> SimNet {
        Self::with_config(Config::default(), n, link, seed)
    }

    pub fn with_config(cfg: Config, n: usize, link: LinkConfig, seed: u64) -> SimNet {
        let start = Instant::now();
        let mut hosts = Vec::new();
        let mut addrs = Vec::new();
        let mut socks = Vec::new();
        for i in 0..n {
            let mut host = Host::with_rng(
                cfg.clone(),
                Eid::from(format!("host-{i}").as_str()),
                StdRng::seed_from_u64(seed.wrapping_mul(1000).wrapping_add(i as u64)),
            );
            let addr: SocketAddr = format!("10.0.0.{}:5000", i + 1).parse().unwrap();
            let sock = host.add_socket(addr);
            hosts.push(host);
            addrs.push(addr);
            socks.push(sock);
        }
        SimNet {
            hosts,
            addrs,
            socks,
            link,
            rng: StdRng::seed_from_u64(seed),
            start,
            now: start,
            heap: BinaryHeap::new(),
            next_id: 0,
            drop_one_after: None,
            dropped_at: None,
        }
    }

    pub fn eid(i: usize) -> Eid {
        Eid::from(format!("host-{i}").as_str())
    }

    pub fn host(&mut self, i: usize) -> &mut Host {
        &mut self.hosts[i]
    }

    pub fn addr(&self, i: usize) -> SocketAddr {
        self.addrs[i]
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    /// Change a host's network address mid-run (roaming). Subsequent
    /// datagrams it sends carry the new source address.
    pub fn set_addr(&mut self, i: usize, addr: SocketAddr) {
        self.addrs[i] = addr;
    }

    /// Arrange for the n-th upcoming datagram from `from` to be dropped.
    pub fn drop_nth_from(&mut self, from: usize, n: u64) {
        self.drop_one_after = Some((from, n));
        self.dropped_at = None;
    }

    pub fn drain_events(&mut self, i: usize) -> Vec<Event> {
        std::iter::from_fn(|| self.hosts[i].poll_event()).collect()
    }

    fn collect(&mut self) {
        for from in 0..self.hosts.len() {
            while let Some(t) = self.hosts[from].poll_transmit() {
                // Targeted one-shot drop.
                if let Some((host, n)) = self.drop_one_after {
                    if host == from {
                        if n == 0 {
                            self.drop_one_after = None;
                            self.dropped_at = Some(self.now);
                            continue;
                        }
                        self.drop_one_after = Some((host, n - 1));
                    }
                }
                // Random loss.
                if self.link.loss > 0.0 && self.rng.gen::<f64>() < self.link.loss {
                    continue;
                }
                let Some(to) = self.addrs.iter().position(|&a| a == t.dest) else {
                    continue;
                };
                let id = self.next_id;
                self.next_id += 1;
                self.heap.push(Reverse(Delivery {
                    at: self.now + self.link.latency,
                    id,
                    to,
                    src: self.addrs[from],
                    data: t.data,
                }));
            }
        }
    }

    /// Advance to the next packet delivery or timer deadline. Returns
    /// false when the network is completely idle.
    pub fn step(&mut self) -> bool {
        self.collect();
        let pkt_at = self.heap.peek().map(|Reverse(d)| d.at);
        let timer_at = self.hosts.iter().filter_map(|h| h.next_timeout()).min();
        let Some(next) = [pkt_at, timer_at].into_iter().flatten().min() else {
            return false;
        };
        self.now = self.now.max(next);

        loop {
            match self.heap.peek() {
                Some(Reverse(d)) if d.at <= self.now => {
                    let Reverse(d) = self.heap.pop().unwrap();
                    self.hosts[d.to].receive_datagram(self.socks[d.to], d.src, d.data, self.now);
                }
                _ => break,
            }
        }
        for h in &mut self.hosts {
            if h.next_timeout().is_some_and(|t| t <= self.now) {
                h.handle_timeout(self.now);
            }
        }
        self.collect();
        true
    }

    /// Step until the virtual clock has advanced by `d` (or the network
    /// goes idle).
    pub fn run_for(&mut self, d: Duration) {
        let end = self.now + d;
        while self.now < end {
            if !self.step() {
                break;
            }
        }
    }

    pub fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            if !self.step() {
                break;
            }
        }
    }

    /// Establish a client/server stream pair over the simulated network.
    pub fn connect_pair(
        &mut self,
        client: usize,
        server: usize,
        service: &str,
        protocol: &str,
    ) -> (StreamHandle, StreamHandle) {
        self.hosts[server].listen(service, protocol).unwrap();
        let hint = self.addrs[server];
        let now = self.now;
        let csh = self.hosts[client]
            .connect(Self::eid(server), service, protocol, Some(hint), now)
            .unwrap();
        for _ in 0..500 {
            if self.hosts[client].stream_state(csh) == Some(StreamState::Connected) {
                break;
            }
            if !self.step() {
                break;
            }
        }
        assert_eq!(
            self.hosts[client].stream_state(csh),
            Some(StreamState::Connected),
            "client failed to connect"
        );
        let ssh = loop {
            if let Some(s) = self.hosts[server].accept(service, protocol) {
                break s;
            }
            assert!(self.step(), "server never accepted");
        };
        (csh, ssh)
    }
}
