//! Stream configuration and the latency/socket-buffer arithmetic derived
//! from it.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fifo::IMPORTANCE_LEVELS;

fn default_max_packet_size() -> usize {
    1400
}
fn default_target_packet_size() -> usize {
    1200
}
fn default_max_bitrate() -> u64 {
    4_000_000
}
fn default_net_latency() -> Vec<u32> {
    vec![200, 400, 600, 800]
}
fn default_fifo_size() -> usize {
    512
}
fn default_au_pool_slots() -> usize {
    16
}
fn default_video_stats_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

/// Sender-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_target_packet_size")]
    pub target_packet_size: usize,
    /// Peak stream bitrate in bit/s; sizes socket buffers and the RTCP
    /// bandwidth share.
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: u64,
    /// Total acquisition-to-output latency budget; 0 disables.
    #[serde(default)]
    pub max_latency_ms: u32,
    /// Per-importance network latency budgets (level 0 first).
    #[serde(default = "default_net_latency")]
    pub max_network_latency_ms: Vec<u32>,
    /// Explicit SO_SNDBUF; 0 derives it from bitrate and latency.
    #[serde(default)]
    pub stream_socket_buffer_size: usize,
    #[serde(default)]
    pub use_rtp_header_extensions: bool,
    #[serde(default = "default_fifo_size")]
    pub nalu_fifo_size: usize,
    #[serde(default = "default_fifo_size")]
    pub packet_fifo_size: usize,
    #[serde(default)]
    pub cname: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            target_packet_size: default_target_packet_size(),
            max_bitrate: default_max_bitrate(),
            max_latency_ms: 0,
            max_network_latency_ms: default_net_latency(),
            stream_socket_buffer_size: 0,
            use_rtp_header_extensions: false,
            nalu_fifo_size: default_fifo_size(),
            packet_fifo_size: default_fifo_size(),
            cname: String::new(),
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size < 64 || self.target_packet_size < 64 {
            return Err(Error::BadParameters("packet sizes must be at least 64 bytes".into()));
        }
        if self.target_packet_size > self.max_packet_size {
            return Err(Error::BadParameters(
                "target_packet_size exceeds max_packet_size".into(),
            ));
        }
        if self.max_network_latency_ms.is_empty()
            || self.max_network_latency_ms.len() > IMPORTANCE_LEVELS
        {
            return Err(Error::BadParameters(format!(
                "max_network_latency_ms needs 1..={IMPORTANCE_LEVELS} levels"
            )));
        }
        Ok(())
    }

    /// SO_SNDBUF: a quarter of the level-0 latency budget worth of data,
    /// floored at 50 ms of stream or 125 KB.
    pub fn socket_buffer_size(&self) -> usize {
        if self.stream_socket_buffer_size > 0 {
            return self.stream_socket_buffer_size;
        }
        derive_socket_buffer(self.max_bitrate, self.max_network_latency_ms[0] as u64)
    }

    /// Effective per-level network latency budgets in microseconds, with
    /// the expected socket-buffer drain time taken out so the in-queue
    /// timeout reflects wire time only.
    pub fn effective_network_latency_us(&self) -> Vec<u64> {
        let drain_us = buffer_drain_us(self.socket_buffer_size(), self.max_bitrate);
        self.max_network_latency_ms
            .iter()
            .map(|&ms| {
                if ms == 0 {
                    0
                } else {
                    ((ms as u64) * 1000).saturating_sub(drain_us).max(1000)
                }
            })
            .collect()
    }

    /// RTCP bandwidth share: 2.5% of the stream bitrate, in bytes/s.
    pub fn rtcp_byte_rate(&self) -> u32 {
        ((self.max_bitrate as f64 * crate::rtcp::RTCP_BANDWIDTH_SHARE) / 8.0) as u32
    }
}

/// Receiver-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: u64,
    #[serde(default = "default_true")]
    pub generate_receiver_reports: bool,
    /// Interval between video-stats uploads to the sender; 0 disables.
    #[serde(default = "default_video_stats_interval_ms")]
    pub video_stats_send_interval_ms: u64,
    /// Reordering/latency budget applied to queued packets.
    #[serde(default = "default_net_latency")]
    pub max_network_latency_ms: Vec<u32>,
    #[serde(default)]
    pub stream_socket_buffer_size: usize,
    #[serde(default = "default_fifo_size")]
    pub packet_fifo_size: usize,
    #[serde(default = "default_au_pool_slots")]
    pub au_pool_slots: usize,
    #[serde(default)]
    pub cname: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
            max_bitrate: default_max_bitrate(),
            generate_receiver_reports: true,
            video_stats_send_interval_ms: default_video_stats_interval_ms(),
            max_network_latency_ms: default_net_latency(),
            stream_socket_buffer_size: 0,
            packet_fifo_size: default_fifo_size(),
            au_pool_slots: default_au_pool_slots(),
            cname: String::new(),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size < 64 {
            return Err(Error::BadParameters("max_packet_size must be at least 64".into()));
        }
        if self.max_network_latency_ms.is_empty()
            || self.max_network_latency_ms.len() > IMPORTANCE_LEVELS
        {
            return Err(Error::BadParameters(format!(
                "max_network_latency_ms needs 1..={IMPORTANCE_LEVELS} levels"
            )));
        }
        Ok(())
    }

    /// SO_RCVBUF against the receiver's own latency budget.
    pub fn socket_buffer_size(&self) -> usize {
        if self.stream_socket_buffer_size > 0 {
            return self.stream_socket_buffer_size;
        }
        derive_socket_buffer(self.max_bitrate, self.max_network_latency_ms[0] as u64)
    }

    /// Packet reordering budget in microseconds (level-0 latency).
    pub fn reorder_timeout_us(&self) -> u64 {
        self.max_network_latency_ms[0] as u64 * 1000
    }

    pub fn rtcp_byte_rate(&self) -> u32 {
        ((self.max_bitrate as f64 * crate::rtcp::RTCP_BANDWIDTH_SHARE) / 8.0) as u32
    }
}

fn derive_socket_buffer(max_bitrate: u64, latency_ms: u64) -> usize {
    let floor = ((max_bitrate * 50 / 1000 / 8) as usize).max(125_000);
    let sized = (max_bitrate * latency_ms / 1000 / 8 / 4) as usize;
    sized.max(floor)
}

/// Expected time to drain a full socket buffer at the stream bitrate.
fn buffer_drain_us(buffer_bytes: usize, max_bitrate: u64) -> u64 {
    if max_bitrate == 0 {
        return 0;
    }
    buffer_bytes as u64 * 8 * 1_000_000 / max_bitrate
}

/// Drop deadline of one NAL unit: the earlier of the acquisition-anchored
/// total budget and the input-anchored network budget. Zero disables.
pub fn nalu_timeout_us(
    ntp_time_us: u64,
    input_time_us: u64,
    max_latency_us: u64,
    net_latency_us: u64,
) -> u64 {
    let total = if max_latency_us > 0 {
        ntp_time_us + max_latency_us
    } else {
        0
    };
    let network = if net_latency_us > 0 {
        input_time_us + net_latency_us
    } else {
        0
    };
    match (total, network) {
        (0, n) => n,
        (t, 0) => t,
        (t, n) => t.min(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_buffer_floor() {
        // 1 Mbit/s, 200 ms budget: sized = 6250 bytes, floor wins.
        let cfg = SenderConfig {
            max_bitrate: 1_000_000,
            ..Default::default()
        };
        assert_eq!(cfg.socket_buffer_size(), 125_000);
    }

    #[test]
    fn test_socket_buffer_scales_with_bitrate() {
        // 40 Mbit/s, 200 ms: sized = 40e6*0.2/8/4 = 250000 > floor 250000
        let cfg = SenderConfig {
            max_bitrate: 40_000_000,
            ..Default::default()
        };
        let floor = (40_000_000u64 * 50 / 1000 / 8) as usize;
        assert_eq!(cfg.socket_buffer_size(), floor.max(250_000));
    }

    #[test]
    fn test_effective_latency_subtracts_drain() {
        let cfg = SenderConfig {
            max_bitrate: 10_000_000,
            stream_socket_buffer_size: 125_000,
            max_network_latency_ms: vec![200, 400],
            ..Default::default()
        };
        // Drain of 125 KB at 10 Mbit/s = 100 ms.
        let eff = cfg.effective_network_latency_us();
        assert_eq!(eff, vec![100_000, 300_000]);
    }

    #[test]
    fn test_effective_latency_zero_disables() {
        let cfg = SenderConfig {
            max_network_latency_ms: vec![0, 100],
            ..Default::default()
        };
        let eff = cfg.effective_network_latency_us();
        assert_eq!(eff[0], 0);
        assert!(eff[1] > 0);
    }

    #[test]
    fn test_nalu_timeout_combination() {
        assert_eq!(nalu_timeout_us(1000, 2000, 0, 0), 0);
        assert_eq!(nalu_timeout_us(1000, 2000, 500, 0), 1500);
        assert_eq!(nalu_timeout_us(1000, 2000, 0, 300), 2300);
        assert_eq!(nalu_timeout_us(1000, 2000, 500, 300), 1500);
        assert_eq!(nalu_timeout_us(1000, 2000, 5000, 300), 2300);
    }

    #[test]
    fn test_validation() {
        let mut cfg = SenderConfig::default();
        cfg.target_packet_size = cfg.max_packet_size + 1;
        assert!(cfg.validate().is_err());

        let cfg = SenderConfig {
            max_network_latency_ms: vec![],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        assert!(SenderConfig::default().validate().is_ok());
        assert!(ReceiverConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: SenderConfig = toml::from_str(
            r#"
            max_bitrate = 8000000
            max_network_latency_ms = [100, 200]
            use_rtp_header_extensions = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_bitrate, 8_000_000);
        assert_eq!(cfg.max_network_latency_ms, vec![100, 200]);
        assert!(cfg.use_rtp_header_extensions);
        assert_eq!(cfg.max_packet_size, 1400); // default preserved
    }
}
