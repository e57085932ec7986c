use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Congestion-control mode, selected at flow creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionMode {
    /// TCP-style slow start, congestion avoidance and fast recovery.
    #[default]
    Tcp,
    /// Permanent slow start clamped by per-round loss accounting.
    Aggressive,
    /// Delay-gradient additive increase/decrease around a power baseline.
    Delay,
    /// Vegas-style expected-vs-actual throughput window adjustment.
    Vegas,
}

/// Packet armor variant for new flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmorKind {
    /// AES-128-CTR encryption with truncated HMAC-SHA-256 authentication.
    #[default]
    AesCtrHmac,
    /// Keyed 32-bit checksum; integrity only, for test configurations.
    Checksum,
}

/// Transport configuration. Durations are stored in milliseconds so the
/// structure round-trips through TOML without custom (de)serializers.
///
/// The `dup_ack_threshold`, `ack_run_bits` and `tx_seq_fatal_margin` knobs
/// expose tuning points the protocol deliberately leaves open; their
/// defaults reproduce the reference behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum transmission unit for a whole packet, headers included.
    pub mtu: usize,
    /// Congestion control mode for new flows.
    pub congestion: CongestionMode,
    /// Packet armor variant for new flows.
    pub armor: ArmorKind,
    /// Initial round-trip estimate before any measurement (ms).
    pub rtt_init_ms: u64,
    /// Ceiling on round-trip estimates and retransmit backoff (ms).
    pub rtt_max_ms: u64,
    /// Minimum congestion window (packets).
    pub cwnd_min: u32,
    /// Maximum congestion window (packets).
    pub cwnd_max: u32,
    /// Delayed-ACK holdoff (ms).
    pub ack_delay_ms: u64,
    /// Data packets allowed to go un-ACKed before a standalone ACK.
    pub ack_data_packets: u32,
    /// Ack-only packets allowed to accumulate before a forced ACK.
    pub ack_only_packets: u32,
    /// Total retransmission budget before a flow declares terminal
    /// connectivity failure (ms).
    pub rtx_fail_ceiling_ms: u64,
    /// Peer reconnection retry interval (ms).
    pub connect_retry_ms: u64,
    /// Out-of-order ACK observations required before the loss response
    /// runs. 0 means any ACK-implied gap triggers it immediately.
    pub dup_ack_threshold: u32,
    /// Width of the wire's contiguous-run ACK counter. Fixed at 4 by the
    /// wire format; present so bookkeeping experiments are explicit.
    pub ack_run_bits: u32,
    /// Remaining sequence space below 2^63 at which a flow goes fatal
    /// rather than risking sequence wrap.
    pub tx_seq_fatal_margin: u64,
    /// Receive-window exponent advertised in stream headers.
    pub receive_window_exp: u8,
    /// Largest datagram sent statelessly, in MTUs; bigger payloads fall
    /// back to an ephemeral substream.
    pub max_stateless_datagram_mtus: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1200,
            congestion: CongestionMode::Tcp,
            armor: ArmorKind::default(),
            rtt_init_ms: 500,
            rtt_max_ms: 10_000,
            cwnd_min: 2,
            cwnd_max: 1 << 20,
            ack_delay_ms: 10,
            ack_data_packets: 2,
            ack_only_packets: 4,
            rtx_fail_ceiling_ms: 30_000,
            connect_retry_ms: 60_000,
            dup_ack_threshold: 0,
            ack_run_bits: 4,
            tx_seq_fatal_margin: 1 << 32,
            receive_window_exp: 16,
            max_stateless_datagram_mtus: 4,
        }
    }
}

impl Config {
    pub fn rtt_init(&self) -> Duration {
        Duration::from_millis(self.rtt_init_ms)
    }
    pub fn rtt_max(&self) -> Duration {
        Duration::from_millis(self.rtt_max_ms)
    }
    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }
    pub fn rtx_fail_ceiling(&self) -> Duration {
        Duration::from_millis(self.rtx_fail_ceiling_ms)
    }
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
    pub fn max_stateless_datagram(&self) -> usize {
        self.mtu * self.max_stateless_datagram_mtus
    }

    /// Parse a configuration from TOML text. Unknown keys are rejected so
    /// typos surface instead of silently applying defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.mtu < 64 {
            return Err(Error::config("mtu below minimum of 64"));
        }
        if self.cwnd_min < 1 || self.cwnd_min > self.cwnd_max {
            return Err(Error::config("cwnd bounds inverted"));
        }
        if self.ack_run_bits != 4 {
            return Err(Error::config("ack_run_bits is fixed at 4 by the wire format"));
        }
        Ok(())
    }
}
