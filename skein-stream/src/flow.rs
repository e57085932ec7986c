//! The flow layer: a secure, sequenced packet conduit between two
//! endpoints. Packets carry a 24-bit truncation of a 64-bit sequence
//! number plus a piggybacked acknowledgment word; the flow reconstructs
//! sequences, replay-protects with a 32-bit receive mask, detects loss
//! from ACK-implied gaps, measures round trips against marked packets,
//! and drives one of the congestion-control modes.
//!
//! The flow is pure state: it never touches a socket or a clock. Inbound
//! packets are handed to [`Flow::receive`], which returns the effects
//! (ACKed/missed sequences, the stripped payload) for the stream layer to
//! apply; outbound packets are sealed by [`Flow::flow_transmit`] and
//! shipped by the caller.

use crate::congestion::Congestion;
use crate::proto::{reconstruct_seq, ACK_SEQ_BITS, FLOW_HDR, MASK_BITS, SEQ_BITS};
use skein_core::{BackoffTimer, Channel, Config, CongestionMode, LinkStatus};
use skein_crypto::Armor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Sequence numbers stay below 2^63; the flow refuses to transmit within
/// a configured margin of the ceiling rather than risking wrap.
pub const SEQ_CEILING: u64 = 1 << 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow is not active")]
    Inactive,
    #[error("packet sequence space exhausted")]
    SeqExhausted,
}

/// Inbound packet dropped before reaching the stream layer; framing
/// errors stay local to the flow.
#[derive(Debug, PartialEq, Eq)]
pub enum RxDrop {
    Inactive,
    Runt,
    Duplicate,
    TooOld,
    AuthFailed,
    AckUnsent,
    SeqWrap,
}

/// Effects of one received packet, applied by the stream layer in order:
/// missed first, then acked, then the payload.
#[derive(Debug)]
pub struct FlowRx {
    pub pkt_seq: u64,
    /// Armor-stripped packet, flow header still in place.
    pub pkt: Vec<u8>,
    pub missed: Vec<u64>,
    pub acked: Vec<u64>,
    pub new_packets: u64,
    pub link_became_up: bool,
}

/// What the receive-side ACK policy wants after a packet is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Piggybacking will cover it.
    None,
    /// Delayed-ACK timer armed.
    Scheduled,
    /// Send a standalone ACK now.
    Immediate,
}

/// Retransmission-timer expiry effects.
#[derive(Debug)]
pub struct RtxOutcome {
    /// Sequences now considered missed (inclusive range).
    pub missed_range: Option<(u64, u64)>,
    /// Total-failure ceiling crossed; the flow is terminally dead.
    pub failed: bool,
}

/// Cumulative flow statistics, EWMA-smoothed once per round trip.
#[derive(Debug, Clone)]
pub struct FlowStats {
    pub rtt_us: f64,
    pub rtt_var_us: f64,
    pub pps: f64,
    pub pps_var: f64,
    pub power: f64,
    pub loss: f64,
    pub last_rtt_us: f64,
    pub last_pps: f64,
}

fn ewma(cur: f64, sample: f64) -> f64 {
    (cur * 7.0 + sample) / 8.0
}

pub struct Flow {
    // Conduit identity.
    remote: SocketAddr,
    local_channel: Channel,
    remote_channel: Channel,
    armor: Armor,
    active: bool,
    link: LinkStatus,

    // Configuration extract.
    rtt_max: Duration,
    ack_delay: Duration,
    ack_data_packets: u32,
    ack_only_packets: u32,
    dup_ack_threshold: u32,
    seq_fatal_margin: u64,

    // Transmit state.
    tx_seq: u64,
    tx_dat_seq: u64,
    tx_ack_seq: u64,
    tx_ack_mask: u32,
    recov_seq: u64,
    gap_streak: u32,

    // Round-trip mark.
    mark_seq: u64,
    mark_time: Instant,
    mark_base: u64,
    mark_sent: u64,
    mark_acks: u64,

    cc: Congestion,
    stats: FlowStats,
    rtx: BackoffTimer,

    // Receive state.
    rx_seq: u64,
    rx_mask: u32,
    rx_ack_ct: u32,
    rx_unacked: u32,
    ack_deadline: Option<Instant>,
}

impl Flow {
    pub fn new(
        cfg: &Config,
        remote: SocketAddr,
        local_channel: Channel,
        remote_channel: Channel,
        armor: Armor,
        now: Instant,
    ) -> Self {
        Self {
            remote,
            local_channel,
            remote_channel,
            armor,
            active: false,
            link: LinkStatus::Down,
            rtt_max: cfg.rtt_max(),
            ack_delay: cfg.ack_delay(),
            ack_data_packets: cfg.ack_data_packets,
            ack_only_packets: cfg.ack_only_packets,
            dup_ack_threshold: cfg.dup_ack_threshold,
            seq_fatal_margin: cfg.tx_seq_fatal_margin,
            tx_seq: 1,
            tx_dat_seq: 0,
            tx_ack_seq: 0,
            tx_ack_mask: 1, // fictitious packet 0 already acked
            recov_seq: 1,
            gap_streak: 0,
            mark_seq: 1,
            mark_time: now,
            mark_base: 0,
            mark_sent: 0,
            mark_acks: 0,
            cc: Congestion::new(cfg.congestion, cfg.cwnd_min, cfg.cwnd_max),
            stats: FlowStats {
                rtt_us: cfg.rtt_init().as_micros() as f64,
                rtt_var_us: 0.0,
                pps: 0.0,
                pps_var: 0.0,
                power: 0.0,
                loss: 0.0,
                last_rtt_us: 0.0,
                last_pps: 0.0,
            },
            rtx: BackoffTimer::new(cfg.rtt_max(), cfg.rtx_fail_ceiling()),
            rx_seq: 0,
            rx_mask: 1, // fictitious packet 0 received
            rx_ack_ct: 0,
            rx_unacked: 0,
            ack_deadline: None,
        }
    }

    pub fn start(&mut self) {
        self.active = true;
        self.link = LinkStatus::Up;
    }

    pub fn stop(&mut self) {
        self.active = false;
        self.link = LinkStatus::Down;
        self.rtx.stop();
        self.ack_deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn link(&self) -> LinkStatus {
        self.link
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Peer migration: re-point the conduit at a new remote endpoint.
    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = remote;
    }

    pub fn local_channel(&self) -> Channel {
        self.local_channel
    }

    pub fn set_local_channel(&mut self, chan: Channel) {
        self.local_channel = chan;
    }

    pub fn remote_channel(&self) -> Channel {
        self.remote_channel
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub fn congestion_window(&self) -> u32 {
        self.cc.window()
    }

    pub fn unacked_packets(&self) -> u64 {
        self.tx_seq - self.tx_ack_seq
    }

    /// Packets the congestion window currently permits.
    pub fn may_transmit(&mut self) -> u32 {
        self.cc.may_transmit(self.tx_seq - self.tx_ack_seq)
    }

    fn rtx_interval(&self) -> Duration {
        let us = self.stats.rtt_us + 4.0 * self.stats.rtt_var_us;
        Duration::from_micros(us as u64).clamp(Duration::from_millis(1), self.rtt_max)
    }

    fn piggyback_ack_word(&self) -> u32 {
        (self.rx_ack_ct.min(15) << 28) | ((self.rx_seq as u32) & 0x0fff_ffff)
    }

    /// Low-level transmit: fill the flow header, seal, consume a sequence
    /// number, and take the round-trip mark when due.
    fn tx(&mut self, pkt: &mut [u8], ack_word: u32, now: Instant) -> Result<(u64, Vec<u8>), FlowError> {
        if !self.active {
            return Err(FlowError::Inactive);
        }
        if self.tx_seq >= SEQ_CEILING - self.seq_fatal_margin {
            return Err(FlowError::SeqExhausted);
        }
        let seq = self.tx_seq;
        debug_assert!(pkt.len() >= FLOW_HDR);
        let word0 = (u32::from(self.remote_channel.0) << SEQ_BITS) | ((seq as u32) & 0x00ff_ffff);
        pkt[0..4].copy_from_slice(&word0.to_be_bytes());
        pkt[4..8].copy_from_slice(&ack_word.to_be_bytes());
        let wire = self.armor.seal(seq, pkt);

        // Point of no return: the sequence number is consumed even if the
        // caller fails to ship the datagram.
        if seq == self.mark_seq {
            self.mark_time = now;
            self.mark_acks = 0;
            self.mark_base = self.tx_ack_seq;
            self.mark_sent = seq - self.tx_ack_seq;
        }
        self.tx_seq += 1;
        trace!(seq, len = wire.len(), "flow tx");
        Ok((seq, wire))
    }

    /// Transmit a data-bearing packet, piggybacking the current ACK state
    /// and arming the retransmission timer.
    pub fn flow_transmit(
        &mut self,
        pkt: &mut [u8],
        now: Instant,
    ) -> Result<(u64, Vec<u8>), FlowError> {
        self.tx_dat_seq = self.tx_seq;
        let ack_word = self.piggyback_ack_word();
        self.rx_unacked = 0;
        self.ack_deadline = None;
        let out = self.tx(pkt, ack_word, now)?;
        if !self.rtx.is_active() {
            let iv = self.rtx_interval();
            self.rtx.start(now, iv);
        }
        Ok(out)
    }

    /// Transmit a standalone acknowledgment.
    pub fn transmit_ack(&mut self, now: Instant) -> Result<(u64, Vec<u8>), FlowError> {
        let mut pkt = vec![0u8; FLOW_HDR];
        let ack_word = self.piggyback_ack_word();
        self.rx_unacked = 0;
        self.ack_deadline = None;
        self.tx(&mut pkt, ack_word, now)
    }

    /// Process an inbound wire datagram up to (but not including) payload
    /// dispatch: sequence reconstruction, replay protection, armor, and
    /// the piggybacked acknowledgment.
    pub fn receive(&mut self, mut pkt: Vec<u8>, now: Instant) -> Result<FlowRx, RxDrop> {
        if !self.active {
            return Err(RxDrop::Inactive);
        }
        if pkt.len() < FLOW_HDR {
            debug!(len = pkt.len(), "flow rx: runt packet");
            return Err(RxDrop::Runt);
        }

        // Reconstruct the 64-bit packet sequence from its 24-bit wire form.
        let word0 = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        let ptxseq = word0 & 0x00ff_ffff;
        let (pkt_seq, seq_diff) = reconstruct_seq(ptxseq, self.rx_seq, SEQ_BITS);
        if seq_diff > 0 {
            if pkt_seq < self.rx_seq {
                warn!("flow rx: 64-bit sequence wraparound detected");
                return Err(RxDrop::SeqWrap);
            }
        } else if seq_diff <= -(MASK_BITS as i32) {
            debug!(pkt_seq, "flow rx: too-old packet dropped");
            return Err(RxDrop::TooOld);
        } else if (self.rx_mask >> (-seq_diff) as u32) & 1 != 0 {
            debug!(pkt_seq, "flow rx: duplicate packet dropped");
            return Err(RxDrop::Duplicate);
        }

        // Authenticate and decrypt.
        if let Err(e) = self.armor.open(pkt_seq, &mut pkt) {
            debug!(pkt_seq, error = %e, "flow rx: armor rejected packet");
            return Err(RxDrop::AuthFailed);
        }

        // Piggybacked acknowledgment word.
        let word1 = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
        let ack_ct = (word1 >> ACK_SEQ_BITS) & 0xf;
        let (ack_seq, ack_diff) =
            reconstruct_seq(word1 & 0x0fff_ffff, self.tx_ack_seq, ACK_SEQ_BITS);
        if ack_seq >= self.tx_seq {
            warn!(ack_seq, tx_seq = self.tx_seq, "flow rx: peer acked unsent packet");
            return Err(RxDrop::AckUnsent);
        }

        let mut acked = Vec::new();
        let mut missed = Vec::new();
        let mut new_packets: u64 = 0;
        let mut straggler_diff = ack_diff;
        let mut link_became_up = false;

        if ack_diff > 0 {
            let advance = ack_diff as u64;
            let old_ack_seq = self.tx_ack_seq;
            self.tx_ack_seq = ack_seq;
            self.tx_ack_mask = if advance < u64::from(MASK_BITS) {
                self.tx_ack_mask << advance
            } else {
                0
            };

            new_packets = advance;
            if new_packets > u64::from(ack_ct) + 1 {
                // The advance implies more packets than the contiguous run
                // the peer reports: the difference went missing.
                let nmissed = new_packets - (u64::from(ack_ct) + 1);
                new_packets = u64::from(ack_ct) + 1;

                self.gap_streak += 1;
                if self.gap_streak > self.dup_ack_threshold {
                    self.gap_streak = 0;
                    match self.cc.mode() {
                        CongestionMode::Tcp | CongestionMode::Delay | CongestionMode::Vegas => {
                            // Inside the fast-recovery window this is not
                            // a fresh loss event.
                            if self.tx_ack_seq - new_packets > self.recov_seq {
                                self.cc.on_loss();
                                self.recov_seq = self.tx_seq;
                            }
                        }
                        CongestionMode::Aggressive => {
                            let lost = (self.tx_ack_seq - self.mark_base)
                                .saturating_sub(self.mark_acks);
                            self.cc.on_loss_aggressive(self.mark_sent, self.mark_acks, lost);
                        }
                    }
                }
                for seq in old_ack_seq + 1..=old_ack_seq + nmissed {
                    missed.push(seq);
                }
            } else {
                self.gap_streak = 0;
            }

            // Record the in-sequence run the ACK attests.
            self.tx_ack_mask |= (1u32 << new_packets) - 1;
            for seq in self.tx_ack_seq - new_packets + 1..=self.tx_ack_seq {
                acked.push(seq);
            }

            // Progress: link is up; re-arm or quiesce the rtx timer.
            if self.link != LinkStatus::Up {
                self.link = LinkStatus::Up;
                link_became_up = true;
            }
            if self.tx_dat_seq > self.tx_ack_seq {
                let iv = self.rtx_interval();
                self.rtx.start(now, iv);
            } else {
                self.rtx.stop();
            }

            straggler_diff = 0;
        }

        // Out-of-order acknowledgments inside the reported run.
        let run_mask = (1u32 << ack_ct) - 1;
        if self.tx_ack_mask & run_mask != run_mask {
            for i in 0..=ack_ct {
                let bit = -straggler_diff + i as i32;
                if bit >= MASK_BITS as i32 {
                    break;
                }
                let bit = bit as u32;
                if u64::from(bit) > self.tx_ack_seq {
                    // Peer claims acks below the start of sequence space.
                    break;
                }
                if self.tx_ack_mask & (1 << bit) != 0 {
                    continue;
                }
                self.tx_ack_mask |= 1 << bit;
                acked.push(self.tx_ack_seq - u64::from(bit));
                new_packets += 1;
            }
        }

        self.mark_acks += new_packets;
        let mark_elapsed_us = now.duration_since(self.mark_time).as_micros() as f64;
        self.cc
            .on_acks(new_packets, self.mark_acks, mark_elapsed_us, self.stats.last_rtt_us);

        // A mark coming back means a full round trip was observed.
        if ack_seq >= self.mark_seq {
            let rtt_us = mark_elapsed_us
                .max(1.0)
                .min(self.rtt_max.as_micros() as f64);
            self.stats.rtt_us = ewma(self.stats.rtt_us, rtt_us);
            self.stats.rtt_var_us =
                ewma(self.stats.rtt_var_us, (rtt_us - self.stats.rtt_us).abs());
            let pps = self.mark_acks as f64 * 1_000_000.0 / rtt_us;
            self.stats.pps = ewma(self.stats.pps, pps);
            self.stats.pps_var = ewma(self.stats.pps_var, (pps - self.stats.pps).abs());
            let power = pps / rtt_us;
            self.stats.power = ewma(self.stats.power, power);
            if self.mark_sent > 0 {
                let loss = (self.mark_sent.saturating_sub(self.mark_acks)) as f64
                    / self.mark_sent as f64;
                self.stats.loss = ewma(self.stats.loss, loss.clamp(0.0, 1.0));
            }
            debug!(
                rtt_us,
                pps,
                cwnd = self.cc.window(),
                loss = self.stats.loss,
                "round trip observed"
            );
            // The next packet transmitted becomes the new mark.
            self.mark_seq = self.tx_seq;
            self.cc
                .on_round_trip(rtt_us, pps, power, self.mark_sent, self.mark_acks);
            self.stats.last_rtt_us = rtt_us;
            self.stats.last_pps = pps;
        }
        self.cc.clamp();

        Ok(FlowRx {
            pkt_seq,
            pkt,
            missed,
            acked,
            new_packets,
            link_became_up,
        })
    }

    /// Update receive-side state for a successfully processed packet and
    /// decide how to acknowledge it. Runs after payload dispatch so a
    /// triggered response can piggyback first.
    pub fn received(&mut self, pkt_seq: u64, is_data: bool, now: Instant) -> AckDisposition {
        let seq_diff = pkt_seq as i64 - self.rx_seq as i64;
        if seq_diff == 1 {
            // In order and contiguous.
            self.rx_seq = pkt_seq;
            self.rx_mask = (self.rx_mask << 1) | 1;
            self.rx_ack_ct = (self.rx_ack_ct + 1).min(15);
            self.rx_unacked += 1;
            if !is_data && self.rx_unacked < self.ack_only_packets {
                // Only ack acks occasionally.
                return AckDisposition::None;
            }
            if self.rx_unacked >= self.ack_only_packets
                || (is_data && self.rx_unacked >= self.ack_data_packets)
            {
                return AckDisposition::Immediate;
            }
            if self.ack_deadline.is_none() {
                self.ack_deadline = Some(now + self.ack_delay);
            }
            AckDisposition::Scheduled
        } else if seq_diff > 1 {
            // In order but discontiguous: one or more packets are likely
            // lost. Ack immediately so the sender can start fast
            // retransmit decisions.
            self.rx_seq = pkt_seq;
            self.rx_mask = if seq_diff < i64::from(MASK_BITS) {
                (self.rx_mask << seq_diff) | 1
            } else {
                1
            };
            self.rx_ack_ct = 0; // meaning one packet received
            AckDisposition::Immediate
        } else {
            // Old packet received out of order; record and ack it now.
            debug_assert!(seq_diff < 0 && -seq_diff < i64::from(MASK_BITS));
            self.rx_mask |= 1 << ((-seq_diff) as u32);
            AckDisposition::Immediate
        }
    }

    /// Whether a delayed ACK is due.
    pub fn ack_due(&self, now: Instant) -> bool {
        self.ack_deadline.is_some_and(|d| d <= now)
    }

    /// Poll the retransmission timer. On expiry the congestion window
    /// collapses, outstanding data is declared missed so reliable
    /// segments requeue, and the link status degrades.
    pub fn poll_rtx(&mut self, now: Instant) -> Option<RtxOutcome> {
        let failed = self.rtx.poll(now)?;
        debug!(interval = ?self.rtx.interval(), failed, "retransmission timeout");
        if !failed {
            self.rtx.restart(now);
        }
        self.cc.on_rtx_timeout(self.tx_seq - self.tx_ack_seq);

        let mut missed_range = None;
        let ack_diff = self.tx_dat_seq.saturating_sub(self.tx_ack_seq);
        if ack_diff > 0 {
            let from = self.tx_ack_seq + 1;
            self.tx_ack_seq = self.tx_dat_seq;
            self.tx_ack_mask = if ack_diff < u64::from(MASK_BITS) {
                (self.tx_ack_mask << ack_diff) | 1
            } else {
                1
            };
            missed_range = Some((from, self.tx_dat_seq));
        }

        self.link = if failed {
            LinkStatus::Down
        } else {
            LinkStatus::Stalled
        };
        Some(RtxOutcome { missed_range, failed })
    }

    /// Earliest deadline of the flow's timers.
    pub fn next_timeout(&self) -> Option<Instant> {
        match (self.rtx.deadline(), self.ack_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    #[cfg(test)]
    pub(crate) fn rx_state(&self) -> (u64, u32, u32) {
        (self.rx_seq, self.rx_mask, self.rx_ack_ct)
    }

    #[cfg(test)]
    pub(crate) fn tx_state(&self) -> (u64, u64, u32) {
        (self.tx_seq, self.tx_ack_seq, self.tx_ack_mask)
    }
}
