//! RTCP control-channel state for both ends of a stream.
//!
//! The sender context digests reception reports (loss, jitter, round-trip
//! time) and schedules its own SR+SDES+APP compounds; the receiver context
//! accumulates reception statistics, keeps an NTP-from-RTP linear
//! regression fed by sender reports, and runs the clock-delta exchange.

use super::{
    ClockDelta, ReceptionReport, ReceiverReport, SdesChunk, SdesItemType, SenderReport, VideoStats,
    RTCP_MIN_PACKET_INTERVAL_US,
};
use crate::time::{ntp_middle32, us_to_ntp};

/// One scheduled source-description item.
#[derive(Debug, Clone)]
pub struct SdesItem {
    pub ty: SdesItemType,
    /// PRIV prefix; empty for the other item types.
    pub prefix: String,
    pub value: String,
    /// Minimum microseconds between transmissions; 0 sends with every
    /// compound.
    pub send_interval_us: u64,
    last_send_us: u64,
}

impl SdesItem {
    pub fn new(ty: SdesItemType, prefix: &str, value: &str, send_interval_us: u64) -> Self {
        Self {
            ty,
            prefix: prefix.to_string(),
            value: value.to_string(),
            send_interval_us,
            last_send_us: 0,
        }
    }
}

/// Table of SDES items keyed by (type, PRIV prefix), each with its own
/// send interval.
#[derive(Debug, Clone, Default)]
pub struct SdesTable {
    items: Vec<SdesItem>,
}

impl SdesTable {
    pub fn new(cname: &str, tool: &str) -> Self {
        let mut table = Self::default();
        table.set(SdesItemType::Cname, "", cname, 0);
        table.set(SdesItemType::Tool, "", tool, 5_000_000);
        table
    }

    /// Insert or replace the item with the given (type, prefix) key.
    pub fn set(&mut self, ty: SdesItemType, prefix: &str, value: &str, send_interval_us: u64) {
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.ty == ty && i.prefix == prefix)
        {
            item.value = value.to_string();
            item.send_interval_us = send_interval_us;
        } else {
            self.items.push(SdesItem::new(ty, prefix, value, send_interval_us));
        }
    }

    /// Items due at `now`, marking them sent. CNAME is always due.
    pub fn due_chunk(&mut self, ssrc: u32, now_us: u64) -> SdesChunk {
        let mut chunk = SdesChunk {
            ssrc,
            items: Vec::new(),
        };
        for item in &mut self.items {
            let due = item.ty == SdesItemType::Cname
                || item.send_interval_us == 0
                || item.last_send_us == 0
                || now_us.saturating_sub(item.last_send_us) >= item.send_interval_us;
            if due {
                item.last_send_us = now_us;
                chunk
                    .items
                    .push((item.ty, item.prefix.clone(), item.value.clone()));
            }
        }
        chunk
    }
}

/// Clock-delta exchange state (one per peer).
///
/// Each round trip carries three timestamps (originate, receive,
/// transmit); together with the local reception time they yield the peer
/// clock offset and the path round-trip delay, smoothed with an EWMA.
#[derive(Debug, Clone, Default)]
pub struct ClockDeltaContext {
    next_peer_originate: u64,
    next_receive: u64,
    pub clock_delta_us: i64,
    pub clock_delta_avg_us: i64,
    pub rt_delay_us: u64,
}

impl ClockDeltaContext {
    /// Digest a received clock-delta payload.
    pub fn process(&mut self, delta: &ClockDelta, reception_us: u64) {
        if delta.originate != 0 && reception_us >= delta.originate {
            let d = ((delta.receive + delta.transmit) / 2) as i64
                - ((delta.originate + reception_us) / 2) as i64;
            self.clock_delta_us = d;
            if self.clock_delta_avg_us == 0 {
                self.clock_delta_avg_us = d;
            } else {
                self.clock_delta_avg_us += (d - self.clock_delta_avg_us) / 32;
            }
            let peer_turnaround = delta.transmit.saturating_sub(delta.receive);
            self.rt_delay_us = (reception_us - delta.originate).saturating_sub(peer_turnaround);
        }
        self.next_peer_originate = delta.transmit;
        self.next_receive = reception_us;
    }

    /// Build the next outgoing payload, echoing the peer's last transmit.
    pub fn generate(&self, transmit_us: u64) -> ClockDelta {
        ClockDelta {
            originate: self.next_peer_originate,
            receive: self.next_receive,
            transmit: transmit_us,
        }
    }
}

/// Peer link quality as digested from reception reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkReport {
    pub round_trip_delay_us: u32,
    pub interarrival_jitter_us: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub ext_highest_seq: u32,
    pub reception_us: u64,
}

/// RTCP state of the sending side.
#[derive(Debug, Clone)]
pub struct SenderRtcpContext {
    pub ssrc: u32,
    pub peer_ssrc: u32,
    pub rtp_clock_rate: u32,
    pub rtp_ts_offset: u32,
    pub rtcp_byte_rate: u32,
    pub sdes: SdesTable,

    pub link: LinkReport,
    pub clock_delta: ClockDeltaContext,
    /// Last video statistics uploaded by the receiver.
    pub peer_video_stats: Option<VideoStats>,

    last_sr_us: u64,
    next_sr_delay_us: u64,
}

impl SenderRtcpContext {
    pub fn new(ssrc: u32, rtp_clock_rate: u32, rtp_ts_offset: u32, rtcp_byte_rate: u32, cname: &str) -> Self {
        Self {
            ssrc,
            peer_ssrc: 0,
            rtp_clock_rate,
            rtp_ts_offset,
            rtcp_byte_rate: rtcp_byte_rate.max(1),
            sdes: SdesTable::new(cname, "uavlink sender"),
            link: LinkReport::default(),
            clock_delta: ClockDeltaContext::default(),
            peer_video_stats: None,
            last_sr_us: 0,
            next_sr_delay_us: RTCP_MIN_PACKET_INTERVAL_US,
        }
    }

    /// Map a local microsecond timestamp to the stream RTP timestamp.
    pub fn rtp_ts_from_us(&self, us: u64) -> u32 {
        (((us * self.rtp_clock_rate as u64 + 500_000) / 1_000_000) + self.rtp_ts_offset as u64)
            as u32
    }

    /// Build the sender-report fields for a compound sent at `send_us`.
    pub fn generate_sender_report(&mut self, send_us: u64, packet_count: u32, byte_count: u32) -> SenderReport {
        self.last_sr_us = send_us;
        SenderReport {
            ssrc: self.ssrc,
            ntp_timestamp: us_to_ntp(send_us),
            rtp_timestamp: self.rtp_ts_from_us(send_us),
            packet_count,
            byte_count,
        }
    }

    /// True once the SR cadence calls for a new compound.
    pub fn sr_due(&self, now_us: u64) -> bool {
        self.last_sr_us == 0 || now_us.saturating_sub(self.last_sr_us) >= self.next_sr_delay_us
    }

    /// Recompute the SR interval from the size of the compound just sent:
    /// `bytes * 1e6 / rtcp_byte_rate`, clamped to at least 100 ms.
    pub fn schedule_next_sr(&mut self, compound_bytes: usize) {
        let delay = compound_bytes as u64 * 1_000_000 / self.rtcp_byte_rate as u64;
        self.next_sr_delay_us = delay.max(RTCP_MIN_PACKET_INTERVAL_US);
    }

    /// Digest a reception report block addressed to us.
    pub fn process_reception_report(&mut self, from_ssrc: u32, rb: &ReceptionReport, reception_us: u64) {
        self.peer_ssrc = from_ssrc;
        self.link.fraction_lost = rb.fraction_lost;
        self.link.cumulative_lost = rb.cumulative_lost;
        self.link.ext_highest_seq = rb.ext_highest_seq;
        self.link.interarrival_jitter_us = ((rb.jitter as u64 * 1_000_000
            + self.rtp_clock_rate as u64 / 2)
            / self.rtp_clock_rate as u64) as u32;
        self.link.reception_us = reception_us;

        if rb.lsr != 0 {
            // LSR/DLSR are in the middle-32 NTP format: 16.16 seconds.
            let lsr_us = (rb.lsr as u64 >> 16) * 1_000_000
                + ((rb.lsr as u64 & 0xFFFF) * 1_000_000 >> 16);
            let dlsr_us = (rb.dlsr as u64 >> 16) * 1_000_000
                + ((rb.dlsr as u64 & 0xFFFF) * 1_000_000 >> 16);
            self.link.round_trip_delay_us =
                reception_us.saturating_sub(lsr_us).saturating_sub(dlsr_us) as u32;
        } else {
            self.link.round_trip_delay_us = 0;
        }
    }
}

/// RTCP state of the receiving side.
#[derive(Debug, Clone)]
pub struct ReceiverRtcpContext {
    pub ssrc: u32,
    pub sender_ssrc: u32,
    pub rtp_clock_rate: u32,
    pub rtcp_byte_rate: u32,
    pub sdes: SdesTable,

    /// First sequence number observed (extended).
    pub first_seq: Option<u32>,
    pub ext_highest_seq: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    /// Interarrival jitter, RTP clock units (RFC 3550 A.8).
    pub interarrival_jitter: u32,
    prev_recv_rtp_ts: u64,
    prev_ext_rtp_ts: u64,
    jitter_primed: bool,

    // NTP <-> RTP regression over the extended timeline: given two sender
    // reports (ntp_i, rtp_i), ntp = (rtp - b) * a_den / a_num.
    ts_a_num: i64,
    ts_a_den: i64,
    ts_b: i64,
    prev_sr_rtp_ts: u64,
    prev_sr_ntp_us: u64,
    pub last_sr_ntp: u64,
    pub last_sr_reception_us: u64,
    pub last_sr_interval_us: u32,

    // Snapshots taken at the previous RR for interval statistics.
    last_rr_ext_highest_seq: u32,
    last_rr_packets_lost: u32,
    last_rr_us: u64,
    next_rr_delay_us: u64,

    pub clock_delta: ClockDeltaContext,
}

impl ReceiverRtcpContext {
    pub fn new(ssrc: u32, rtp_clock_rate: u32, rtcp_byte_rate: u32, cname: &str) -> Self {
        Self {
            ssrc,
            sender_ssrc: 0,
            rtp_clock_rate,
            rtcp_byte_rate: rtcp_byte_rate.max(1),
            sdes: SdesTable::new(cname, "uavlink receiver"),
            first_seq: None,
            ext_highest_seq: 0,
            packets_received: 0,
            packets_lost: 0,
            interarrival_jitter: 0,
            prev_recv_rtp_ts: 0,
            prev_ext_rtp_ts: 0,
            jitter_primed: false,
            ts_a_num: 0,
            ts_a_den: 0,
            ts_b: 0,
            prev_sr_rtp_ts: 0,
            prev_sr_ntp_us: 0,
            last_sr_ntp: 0,
            last_sr_reception_us: 0,
            last_sr_interval_us: 0,
            last_rr_ext_highest_seq: 0,
            last_rr_packets_lost: 0,
            last_rr_us: 0,
            next_rr_delay_us: RTCP_MIN_PACKET_INTERVAL_US,
            clock_delta: ClockDeltaContext::default(),
        }
    }

    /// Per-packet reception accounting, called by the batch receive path.
    ///
    /// `arrival_us` is the local arrival time; the jitter transit uses it
    /// scaled to RTP clock units against the packet's extended timestamp.
    pub fn on_packet_received(&mut self, ext_seq: u32, ext_rtp_ts: u64, arrival_us: u64) {
        if self.first_seq.is_none() {
            self.first_seq = Some(ext_seq);
            self.ext_highest_seq = ext_seq;
        } else if ext_seq > self.ext_highest_seq {
            self.ext_highest_seq = ext_seq;
        }

        let recv_rtp_ts = arrival_us * self.rtp_clock_rate as u64 / 1_000_000;
        if self.jitter_primed {
            let d = (self.prev_recv_rtp_ts as i64 - self.prev_ext_rtp_ts as i64)
                - (recv_rtp_ts as i64 - ext_rtp_ts as i64);
            let d = d.unsigned_abs() as i64;
            self.interarrival_jitter = (self.interarrival_jitter as i64
                + (d - self.interarrival_jitter as i64) / 16)
                as u32;
        }
        self.prev_recv_rtp_ts = recv_rtp_ts;
        self.prev_ext_rtp_ts = ext_rtp_ts;
        self.jitter_primed = true;
    }

    /// Digest a sender report; `ext_rtp_ts` is the SR's RTP timestamp on
    /// the extended timeline.
    pub fn process_sender_report(&mut self, sr: &SenderReport, ext_rtp_ts: u64, reception_us: u64) {
        self.sender_ssrc = sr.ssrc;
        let ntp_us = crate::time::ntp_to_us(sr.ntp_timestamp);

        if self.prev_sr_ntp_us != 0 && ntp_us > self.prev_sr_ntp_us {
            self.ts_a_num = ext_rtp_ts as i64 - self.prev_sr_rtp_ts as i64;
            self.ts_a_den = ntp_us as i64 - self.prev_sr_ntp_us as i64;
            self.ts_b = if self.ts_a_den != 0 {
                ext_rtp_ts as i64
                    - ((self.ts_a_num as i128 * ntp_us as i128 + self.ts_a_den as i128 / 2)
                        / self.ts_a_den as i128) as i64
            } else {
                0
            };
            self.last_sr_interval_us = (ntp_us - self.prev_sr_ntp_us) as u32;
        }
        self.prev_sr_rtp_ts = ext_rtp_ts;
        self.prev_sr_ntp_us = ntp_us;
        self.last_sr_ntp = sr.ntp_timestamp;
        self.last_sr_reception_us = reception_us;
    }

    /// Map an extended RTP timestamp to sender NTP microseconds through
    /// the SR regression. Returns 0 until two SRs have been seen.
    pub fn ntp_us_from_rtp(&self, ext_rtp_ts: u64) -> u64 {
        if self.ts_a_num != 0 && self.ts_a_den != 0 {
            (((ext_rtp_ts as i128 - self.ts_b as i128) * self.ts_a_den as i128
                + self.ts_a_num as i128 / 2)
                / self.ts_a_num as i128) as u64
        } else {
            0
        }
    }

    /// Inverse mapping of [`ntp_us_from_rtp`](Self::ntp_us_from_rtp).
    pub fn rtp_from_ntp_us(&self, ntp_us: u64) -> u64 {
        if self.ts_a_num != 0 && self.ts_a_den != 0 {
            (self.ts_b as i128
                + (ntp_us as i128 * self.ts_a_num as i128 + self.ts_a_den as i128 / 2)
                    / self.ts_a_den as i128) as u64
        } else {
            0
        }
    }

    /// True once the RR cadence calls for a new compound.
    pub fn rr_due(&self, now_us: u64) -> bool {
        self.last_rr_us == 0 || now_us.saturating_sub(self.last_rr_us) >= self.next_rr_delay_us
    }

    /// Recompute the RR interval from the compound just sent.
    pub fn schedule_next_rr(&mut self, compound_bytes: usize) {
        let delay = compound_bytes as u64 * 1_000_000 / self.rtcp_byte_rate as u64;
        self.next_rr_delay_us = delay.max(RTCP_MIN_PACKET_INTERVAL_US);
    }

    /// Build a receiver report for the active sender at `now_us`.
    pub fn generate_receiver_report(&mut self, now_us: u64) -> ReceiverReport {
        self.last_rr_us = now_us;
        let Some(first_seq) = self.first_seq else {
            return ReceiverReport {
                ssrc: self.ssrc,
                report: None,
            };
        };

        let interval_expected = self
            .ext_highest_seq
            .saturating_sub(self.last_rr_ext_highest_seq);
        let interval_lost = self.packets_lost.saturating_sub(self.last_rr_packets_lost);
        let fraction_lost = if interval_expected > 0 {
            ((interval_lost as u64 * 256) / interval_expected as u64).min(255) as u8
        } else {
            0
        };
        self.last_rr_ext_highest_seq = self.ext_highest_seq;
        self.last_rr_packets_lost = self.packets_lost;

        let cumulative_lost = (self.ext_highest_seq as i64 - first_seq as i64 + 1
            - self.packets_received as i64)
            .clamp(0, 0x007F_FFFF) as u32;

        let dlsr = if self.last_sr_reception_us != 0 {
            let since = now_us.saturating_sub(self.last_sr_reception_us);
            ((since << 16) / 1_000_000) as u32
        } else {
            0
        };

        ReceiverReport {
            ssrc: self.ssrc,
            report: Some(ReceptionReport {
                ssrc: self.sender_ssrc,
                fraction_lost,
                cumulative_lost,
                ext_highest_seq: self.ext_highest_seq,
                jitter: self.interarrival_jitter,
                lsr: if self.last_sr_ntp != 0 {
                    ntp_middle32(self.last_sr_ntp)
                } else {
                    0
                },
                dlsr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdes_table_intervals() {
        let mut table = SdesTable::new("a@b", "tool");
        table.set(SdesItemType::Priv, "bat", "87", 1_000_000);

        // First compound carries everything.
        let chunk = table.due_chunk(1, 10);
        assert_eq!(chunk.items.len(), 3);

        // Shortly after only CNAME is due.
        let chunk = table.due_chunk(1, 500_000);
        assert_eq!(chunk.items.len(), 1);
        assert_eq!(chunk.items[0].0, SdesItemType::Cname);

        // After the PRIV interval elapses it is due again.
        let chunk = table.due_chunk(1, 1_600_010);
        let types: Vec<_> = chunk.items.iter().map(|i| i.0).collect();
        assert!(types.contains(&SdesItemType::Priv));
    }

    #[test]
    fn test_clock_delta_symmetric_exchange() {
        // Peer clock runs 500us ahead; one-way delay 100us each way.
        let offset: i64 = 500;
        let mut ours = ClockDeltaContext::default();

        // We probe at t=1000 (our clock). Peer receives at 1000+100+offset,
        // answers at +50 turnaround; we receive the answer 100us later.
        let peer_recv = (1000i64 + 100 + offset) as u64;
        let peer_xmit = peer_recv + 50;
        let our_recv = 1000 + 100 + 50 + 100;
        ours.process(
            &ClockDelta {
                originate: 1000,
                receive: peer_recv,
                transmit: peer_xmit,
            },
            our_recv,
        );
        assert_eq!(ours.clock_delta_us, offset);
        assert_eq!(ours.rt_delay_us, 200);
        assert_eq!(ours.clock_delta_avg_us, offset);

        // Our next packet echoes the peer's transmit time.
        let out = ours.generate(5000);
        assert_eq!(out.originate, peer_xmit);
        assert_eq!(out.receive, our_recv);
        assert_eq!(out.transmit, 5000);
    }

    #[test]
    fn test_round_trip_law() {
        // SR sent at T0=2_000_000us, received and acknowledged with
        // DLSR=300ms; RR arrives at T0 + wire + dlsr.
        let mut ctx = SenderRtcpContext::new(1, 90_000, 0, 1000, "s@uav");
        let t0_us = 2_000_000u64;
        let wire_us = 4_000u64; // 2ms each way
        let dlsr_us = 300_000u64;

        let lsr = ntp_middle32(us_to_ntp(t0_us));
        let dlsr = ((dlsr_us << 16) / 1_000_000) as u32;
        let rb = ReceptionReport {
            ssrc: 1,
            lsr,
            dlsr,
            ..Default::default()
        };
        let reception_us = t0_us + wire_us + dlsr_us;
        ctx.process_reception_report(2, &rb, reception_us);
        let rtt = ctx.link.round_trip_delay_us as i64;
        assert!(
            (rtt - wire_us as i64).abs() < 1_000,
            "rtt={rtt} wire={wire_us}"
        );
    }

    #[test]
    fn test_regression_exact_within_hull() {
        let mut ctx = ReceiverRtcpContext::new(1, 90_000, 1000, "r@gcs");
        // Two SRs one second apart: 90_000 RTP ticks per 1_000_000 us.
        let sr0 = SenderReport {
            ssrc: 7,
            ntp_timestamp: us_to_ntp(10_000_000),
            rtp_timestamp: 900_000,
            ..Default::default()
        };
        let sr1 = SenderReport {
            ntp_timestamp: us_to_ntp(11_000_000),
            rtp_timestamp: 990_000,
            ..sr0
        };
        ctx.process_sender_report(&sr0, 900_000, 100);
        ctx.process_sender_report(&sr1, 990_000, 200);

        // Map RTP -> NTP -> RTP for points inside the hull.
        for rtp in [900_000u64, 945_000, 954_321, 990_000] {
            let ntp = ctx.ntp_us_from_rtp(rtp);
            let expected_ntp = rtp * 1_000_000 / 90_000;
            assert!(
                ntp.abs_diff(expected_ntp) <= 1,
                "rtp={rtp} ntp={ntp} expected={expected_ntp}"
            );
            let back = ctx.rtp_from_ntp_us(ntp);
            assert_eq!(back, rtp, "rtp={rtp} ntp={ntp} back={back}");
        }
    }

    #[test]
    fn test_jitter_steady_stream_is_zero() {
        let mut ctx = ReceiverRtcpContext::new(1, 90_000, 1000, "r@gcs");
        // Perfectly paced 30fps stream: 3000 ticks per 33_333us.
        for i in 0..50u64 {
            ctx.on_packet_received(i as u32, i * 3000, i * 33_333);
        }
        assert!(ctx.interarrival_jitter <= 2, "jitter={}", ctx.interarrival_jitter);
    }

    #[test]
    fn test_jitter_converges_under_variation() {
        let mut ctx = ReceiverRtcpContext::new(1, 90_000, 1000, "r@gcs");
        for i in 0..200u64 {
            // +/-5ms alternating arrival error.
            let wobble = if i % 2 == 0 { 5_000 } else { 0 };
            ctx.on_packet_received(i as u32, i * 3000, i * 33_333 + wobble);
        }
        // 5ms at 90kHz is 450 ticks; the EWMA settles in that vicinity.
        assert!(ctx.interarrival_jitter > 100, "jitter={}", ctx.interarrival_jitter);
        assert!(ctx.interarrival_jitter < 900, "jitter={}", ctx.interarrival_jitter);
    }

    #[test]
    fn test_receiver_report_fraction_lost() {
        let mut ctx = ReceiverRtcpContext::new(1, 90_000, 1000, "r@gcs");
        ctx.sender_ssrc = 9;
        // 8 of 10 packets arrive.
        let mut seq = 0u32;
        for i in 0..10u32 {
            if i == 3 || i == 7 {
                continue;
            }
            ctx.on_packet_received(i, i as u64 * 3000, i as u64 * 33_333);
            ctx.packets_received += 1;
            seq = i;
        }
        ctx.packets_lost = 2;

        let rr = ctx.generate_receiver_report(1_000_000);
        let rb = rr.report.unwrap();
        assert_eq!(rb.ssrc, 9);
        assert_eq!(rb.ext_highest_seq, seq);
        assert_eq!(rb.cumulative_lost, 2);
        // 2 lost over 9 expected in the interval: 2*256/9 = 56.
        assert_eq!(rb.fraction_lost, 56);
    }

    #[test]
    fn test_sr_scheduling_clamps_to_floor() {
        let mut ctx = SenderRtcpContext::new(1, 90_000, 0, 1_000_000, "s@uav");
        assert!(ctx.sr_due(0));
        ctx.generate_sender_report(1_000, 0, 0);
        ctx.schedule_next_sr(64); // 64us of budget -> clamped to 100ms
        assert!(!ctx.sr_due(50_000));
        assert!(ctx.sr_due(1_000 + 100_000));
    }
}
