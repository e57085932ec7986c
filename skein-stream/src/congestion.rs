//! Congestion-control state for a flow. One of a closed set of modes is
//! chosen at flow creation and dispatched by tag.

use skein_core::CongestionMode;
use tracing::debug;

/// Window state shared by every mode, in packets per round-trip.
#[derive(Debug)]
pub struct Congestion {
    mode: CongestionMode,
    min: u32,
    max: u32,
    cwnd: u32,
    /// Whether the window was the limiting factor since the last round.
    cwnd_lim: bool,
    ssthresh: u32,
    /// Aggressive/delay modes: per-round ACK baseline for growth.
    ssbase: u64,
    /// Delay mode: +1 while probing up, -1 while backing down.
    cwnd_inc: i32,
    // Delay/Vegas baselines. Times in microseconds.
    base_rtt: f64,
    base_pps: f64,
    base_pwr: f64,
    base_wnd: u64,
}

impl Congestion {
    pub fn new(mode: CongestionMode, min: u32, max: u32) -> Self {
        Self {
            mode,
            min,
            max,
            cwnd: min,
            cwnd_lim: true,
            ssthresh: max,
            ssbase: 0,
            cwnd_inc: 1,
            base_rtt: 0.0,
            base_pps: 0.0,
            base_pwr: 0.0,
            base_wnd: 0,
        }
    }

    pub fn mode(&self) -> CongestionMode {
        self.mode
    }

    pub fn window(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Packets the window permits beyond the given in-flight count.
    /// Records when the window is the limiting factor.
    pub fn may_transmit(&mut self, inflight: u64) -> u32 {
        if u64::from(self.cwnd) > inflight {
            self.cwnd - inflight as u32
        } else {
            self.cwnd_lim = true;
            0
        }
    }

    /// Loss detected via an ACK-implied gap, outside any fast-recovery
    /// window (TCP-family modes).
    pub fn on_loss(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(self.min);
        debug!(cwnd = self.cwnd, ssthresh = self.ssthresh, "loss event: window cut");
        self.cwnd = self.ssthresh;
    }

    /// Loss response for the aggressive mode: clamp the window to the
    /// packets still expected this round-trip.
    pub fn on_loss_aggressive(&mut self, mark_sent: u64, acked_since_mark: u64, lost: u64) {
        let lost = lost.min(mark_sent.saturating_sub(acked_since_mark));
        let expected = mark_sent.saturating_sub(lost);
        if expected < u64::from(self.cwnd) {
            debug!(cwnd = self.cwnd, expected, "aggressive loss clamp");
            self.ssbase = expected;
            self.cwnd = (expected as u32).max(self.min);
        }
    }

    /// Per-ACK window growth. `mark_elapsed_us`/`last_rtt_us` gate the
    /// aggressive-family growth to ACKs arriving on schedule.
    pub fn on_acks(
        &mut self,
        new_packets: u64,
        mark_acks: u64,
        mark_elapsed_us: f64,
        last_rtt_us: f64,
    ) {
        if new_packets == 0 {
            return;
        }
        match self.mode {
            CongestionMode::Tcp | CongestionMode::Vegas => {
                // Slow start: one window increment per newly ACKed packet,
                // capped at the threshold.
                if self.cwnd_lim && self.cwnd < self.ssthresh {
                    self.cwnd = (self.cwnd + new_packets as u32).min(self.ssthresh);
                }
            }
            CongestionMode::Delay if self.cwnd_inc < 0 => {}
            CongestionMode::Delay | CongestionMode::Aggressive => {
                if mark_acks > self.ssbase && (last_rtt_us == 0.0 || mark_elapsed_us <= last_rtt_us)
                {
                    let room = mark_acks - self.ssbase;
                    self.cwnd = self.cwnd.saturating_add(new_packets.min(room) as u32);
                }
            }
        }
        self.clamp();
    }

    /// Per-round-trip update, fed fresh RTT/throughput measurements.
    pub fn on_round_trip(&mut self, rtt_us: f64, pps: f64, pwr: f64, mark_sent: u64, mark_acks: u64) {
        match self.mode {
            CongestionMode::Tcp => {
                // Congestion avoidance: +1 per RTT, but only for rounds in
                // which the window was the limiting factor.
                if self.cwnd_lim {
                    self.cwnd += 1;
                }
                self.cwnd_lim = false;
            }
            CongestionMode::Aggressive => {}
            CongestionMode::Delay => {
                if pwr > self.base_pwr {
                    self.base_pwr = pwr;
                    self.base_rtt = rtt_us;
                    self.base_pps = pps;
                    self.base_wnd = mark_acks;
                } else if mark_acks <= self.base_wnd && rtt_us > self.base_rtt {
                    self.base_rtt = rtt_us;
                    self.base_pwr = self.base_pps / self.base_rtt;
                } else if mark_acks >= self.base_wnd && pps < self.base_pps {
                    self.base_pps = pps;
                    self.base_pwr = self.base_pps / self.base_rtt;
                }

                if self.cwnd_inc > 0 {
                    // Window going up; reverse on an RTT jump.
                    if rtt_us > self.base_rtt || self.cwnd >= self.max {
                        self.cwnd_inc = -1;
                    } else {
                        self.cwnd += 1;
                    }
                } else {
                    // Window going down; reverse when throughput dives.
                    if pps < self.base_pps || self.cwnd <= self.min {
                        self.ssbase = u64::from(self.cwnd);
                        self.cwnd += 1;
                        self.cwnd_inc = 1;
                    } else {
                        self.cwnd -= 1;
                    }
                }
            }
            CongestionMode::Vegas => {
                if self.base_rtt == 0.0 || rtt_us < self.base_rtt {
                    self.base_rtt = rtt_us;
                } else {
                    self.base_rtt = (self.base_rtt * 255.0 + rtt_us) / 256.0;
                }
                let expect = mark_sent as f64 / self.base_rtt;
                let actual = mark_sent as f64 / rtt_us;
                let diff_per_rtt = (expect - actual) * rtt_us;
                if diff_per_rtt < 1.0 && self.cwnd < self.max {
                    self.cwnd += 1;
                } else if diff_per_rtt > 3.0 && self.cwnd > self.min {
                    self.cwnd -= 1;
                }
            }
        }
        self.clamp();
    }

    /// Retransmission timeout: collapse to the minimum window and restart
    /// slow start from half the outstanding data.
    pub fn on_rtx_timeout(&mut self, inflight: u64) {
        self.ssthresh = ((inflight / 2) as u32).max(self.min);
        self.cwnd = self.min;
    }

    pub fn clamp(&mut self) {
        self.cwnd = self.cwnd.clamp(self.min, self.max);
        self.ssthresh = self.ssthresh.max(self.min);
    }
}
