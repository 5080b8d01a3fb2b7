//! RTCP compound packet building and parsing (RFC 3550).
//!
//! Compound packets always begin with an SR or RR, followed by an SDES
//! chunk and optional APP blocks, each aligned to 4 bytes:
//!
//! ```text
//! +--------+--------+----------------+----------------+
//! | SR/RR  | SDES   | APP (optional) | APP (optional) |
//! +--------+--------+----------------+----------------+
//! ```
//!
//! Two application-defined packets are used on the control channel:
//! subtype 1 carries a three-timestamp clock-delta exchange, subtype 2
//! carries the receiver's video quality statistics.

pub mod state;

use crate::error::{Error, Result};

/// RTCP packet types (RFC 3550 §12.1).
pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;

/// SDES item types (RFC 3550 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdesItemType {
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Loc = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl SdesItemType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Cname),
            2 => Some(Self::Name),
            3 => Some(Self::Email),
            4 => Some(Self::Phone),
            5 => Some(Self::Loc),
            6 => Some(Self::Tool),
            7 => Some(Self::Note),
            8 => Some(Self::Priv),
            _ => None,
        }
    }
}

/// Name field of the application-defined control packets.
pub const APP_PACKET_NAME: u32 = 0x4152_5354;
/// APP subtype: clock-delta exchange.
pub const APP_SUBTYPE_CLOCK_DELTA: u8 = 1;
/// APP subtype: video statistics upload.
pub const APP_SUBTYPE_VIDEO_STATS: u8 = 2;

/// Share of the stream bitrate granted to the control channel.
pub const RTCP_BANDWIDTH_SHARE: f64 = 0.025;
/// Floor for the report interval, in microseconds.
pub const RTCP_MIN_PACKET_INTERVAL_US: u64 = 100_000;
/// Control-channel byte rate used before the stream bitrate is known.
pub const RTCP_DEFAULT_BYTE_RATE: u32 = 25_000 / 8;

/// Macroblock status histogram dimensions in the video-stats payload.
pub const MB_STATUS_CLASS_COUNT: usize = 6;
pub const MB_STATUS_ZONE_COUNT: usize = 5;

/// RTCP Sender Report contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    /// NTP 32.32 fixed-point wall clock at report generation.
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub byte_count: u32,
}

/// One reception report block (carried in an RR, or appended to an SR).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative loss, saturated per RFC 3550 A.3.
    pub cumulative_lost: u32,
    pub ext_highest_seq: u32,
    /// Interarrival jitter in RTP clock units.
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub lsr: u32,
    /// Delay since last SR in 1/65536 s units.
    pub dlsr: u32,
}

/// Receiver Report: reporter SSRC plus at most one reception block (the
/// core supports a single sender per session).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub report: Option<ReceptionReport>,
}

/// Source description chunk for one SSRC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    /// (type, PRIV prefix, value); the prefix is empty for non-PRIV items.
    pub items: Vec<(SdesItemType, String, String)>,
}

/// Goodbye packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bye {
    pub ssrc: u32,
    pub reason: Option<String>,
}

/// Clock-delta APP payload: three 64-bit microsecond timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockDelta {
    /// Peer's transmit time echoed back (0 on an unsolicited probe).
    pub originate: u64,
    /// Our reception time of the peer's last packet.
    pub receive: u64,
    /// Our transmit time.
    pub transmit: u64,
}

/// Video statistics APP payload (subtype 2), fixed wire layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoStats {
    pub timestamp_us: u64,
    pub total_frame_count: u32,
    pub output_frame_count: u32,
    pub errored_output_frame_count: u32,
    pub missed_frame_count: u32,
    pub discarded_frame_count: u32,
    pub errored_second_count: u32,
    pub errored_second_count_by_zone: [u32; MB_STATUS_ZONE_COUNT],
    pub macroblock_status: [[u32; MB_STATUS_ZONE_COUNT]; MB_STATUS_CLASS_COUNT],
    pub timestamp_delta_integral: u64,
    pub timestamp_delta_integral_sq: u64,
    pub timing_error_integral: u64,
    pub timing_error_integral_sq: u64,
    pub estimated_latency_integral: u64,
    pub estimated_latency_integral_sq: u64,
    pub rssi: i8,
}

impl Default for VideoStats {
    fn default() -> Self {
        Self {
            timestamp_us: 0,
            total_frame_count: 0,
            output_frame_count: 0,
            errored_output_frame_count: 0,
            missed_frame_count: 0,
            discarded_frame_count: 0,
            errored_second_count: 0,
            errored_second_count_by_zone: [0; MB_STATUS_ZONE_COUNT],
            macroblock_status: [[0; MB_STATUS_ZONE_COUNT]; MB_STATUS_CLASS_COUNT],
            timestamp_delta_integral: 0,
            timestamp_delta_integral_sq: 0,
            timing_error_integral: 0,
            timing_error_integral_sq: 0,
            estimated_latency_integral: 0,
            estimated_latency_integral_sq: 0,
            rssi: 0,
        }
    }
}

/// One parsed packet out of a compound.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    SenderReport {
        sr: SenderReport,
        report: Option<ReceptionReport>,
    },
    ReceiverReport(ReceiverReport),
    Sdes(Vec<SdesChunk>),
    Bye(Bye),
    ClockDelta {
        ssrc: u32,
        delta: ClockDelta,
    },
    VideoStats {
        ssrc: u32,
        stats: Box<VideoStats>,
    },
    Unknown(u8),
}

/// Demux helper: RTCP compound packets carry payload types 200..=204 in
/// byte 1, which cannot collide with the dynamic RTP payload type.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 8 && (200..=204).contains(&data[1])
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    ((read_u32(data, offset) as u64) << 32) | read_u32(data, offset + 4) as u64
}

fn write_reception_report(out: &mut Vec<u8>, rb: &ReceptionReport) {
    put_u32(out, rb.ssrc);
    out.push(rb.fraction_lost);
    let lost = rb.cumulative_lost & 0x00FF_FFFF;
    out.push((lost >> 16) as u8);
    out.push((lost >> 8) as u8);
    out.push(lost as u8);
    put_u32(out, rb.ext_highest_seq);
    put_u32(out, rb.jitter);
    put_u32(out, rb.lsr);
    put_u32(out, rb.dlsr);
}

fn parse_reception_report(data: &[u8], offset: usize) -> ReceptionReport {
    ReceptionReport {
        ssrc: read_u32(data, offset),
        fraction_lost: data[offset + 4],
        cumulative_lost: ((data[offset + 5] as u32) << 16)
            | ((data[offset + 6] as u32) << 8)
            | data[offset + 7] as u32,
        ext_highest_seq: read_u32(data, offset + 8),
        jitter: read_u32(data, offset + 12),
        lsr: read_u32(data, offset + 16),
        dlsr: read_u32(data, offset + 20),
    }
}

/// Backpatch the 16-bit length field (32-bit words minus one) of the
/// packet that started at `start`.
fn patch_length(out: &mut [u8], start: usize) {
    let words = (out.len() - start) / 4 - 1;
    out[start + 2] = (words >> 8) as u8;
    out[start + 3] = words as u8;
}

/// Append a Sender Report, with an optional reception block.
pub fn write_sender_report(out: &mut Vec<u8>, sr: &SenderReport, report: Option<&ReceptionReport>) {
    let start = out.len();
    let rc = if report.is_some() { 1 } else { 0 };
    out.push(0x80 | rc);
    out.push(PT_SR);
    out.extend_from_slice(&[0, 0]); // length, patched below
    put_u32(out, sr.ssrc);
    put_u64(out, sr.ntp_timestamp);
    put_u32(out, sr.rtp_timestamp);
    put_u32(out, sr.packet_count);
    put_u32(out, sr.byte_count);
    if let Some(rb) = report {
        write_reception_report(out, rb);
    }
    patch_length(out, start);
}

/// Append a Receiver Report.
pub fn write_receiver_report(out: &mut Vec<u8>, rr: &ReceiverReport) {
    let start = out.len();
    let rc = if rr.report.is_some() { 1 } else { 0 };
    out.push(0x80 | rc);
    out.push(PT_RR);
    out.extend_from_slice(&[0, 0]);
    put_u32(out, rr.ssrc);
    if let Some(rb) = &rr.report {
        write_reception_report(out, rb);
    }
    patch_length(out, start);
}

/// Append an SDES packet with a single chunk.
pub fn write_sdes(out: &mut Vec<u8>, chunk: &SdesChunk) {
    let start = out.len();
    out.push(0x81); // V=2, SC=1
    out.push(PT_SDES);
    out.extend_from_slice(&[0, 0]);
    put_u32(out, chunk.ssrc);
    for (ty, prefix, value) in &chunk.items {
        out.push(*ty as u8);
        if *ty == SdesItemType::Priv {
            let total = 1 + prefix.len() + value.len();
            out.push(total.min(255) as u8);
            out.push(prefix.len().min(255) as u8);
            out.extend_from_slice(prefix.as_bytes());
            out.extend_from_slice(value.as_bytes());
        } else {
            out.push(value.len().min(255) as u8);
            out.extend_from_slice(value.as_bytes());
        }
    }
    out.push(0); // end of items
    while (out.len() - start) % 4 != 0 {
        out.push(0);
    }
    patch_length(out, start);
}

/// Append a BYE packet.
pub fn write_bye(out: &mut Vec<u8>, bye: &Bye) {
    let start = out.len();
    out.push(0x81); // one SSRC
    out.push(PT_BYE);
    out.extend_from_slice(&[0, 0]);
    put_u32(out, bye.ssrc);
    if let Some(reason) = &bye.reason {
        out.push(reason.len().min(255) as u8);
        out.extend_from_slice(reason.as_bytes());
        while (out.len() - start) % 4 != 0 {
            out.push(0);
        }
    }
    patch_length(out, start);
}

fn write_app_header(out: &mut Vec<u8>, subtype: u8, ssrc: u32) -> usize {
    let start = out.len();
    out.push(0x80 | (subtype & 0x1F));
    out.push(PT_APP);
    out.extend_from_slice(&[0, 0]);
    put_u32(out, ssrc);
    put_u32(out, APP_PACKET_NAME);
    start
}

/// Append a clock-delta APP packet (subtype 1).
pub fn write_clock_delta(out: &mut Vec<u8>, ssrc: u32, delta: &ClockDelta) {
    let start = write_app_header(out, APP_SUBTYPE_CLOCK_DELTA, ssrc);
    put_u64(out, delta.originate);
    put_u64(out, delta.receive);
    put_u64(out, delta.transmit);
    patch_length(out, start);
}

/// Append a video-stats APP packet (subtype 2).
pub fn write_video_stats(out: &mut Vec<u8>, ssrc: u32, stats: &VideoStats) {
    let start = write_app_header(out, APP_SUBTYPE_VIDEO_STATS, ssrc);
    put_u64(out, stats.timestamp_us);
    put_u32(out, stats.total_frame_count);
    put_u32(out, stats.output_frame_count);
    put_u32(out, stats.errored_output_frame_count);
    put_u32(out, stats.missed_frame_count);
    put_u32(out, stats.discarded_frame_count);
    put_u32(out, stats.errored_second_count);
    for v in &stats.errored_second_count_by_zone {
        put_u32(out, *v);
    }
    for class in &stats.macroblock_status {
        for v in class {
            put_u32(out, *v);
        }
    }
    put_u64(out, stats.timestamp_delta_integral);
    put_u64(out, stats.timestamp_delta_integral_sq);
    put_u64(out, stats.timing_error_integral);
    put_u64(out, stats.timing_error_integral_sq);
    put_u64(out, stats.estimated_latency_integral);
    put_u64(out, stats.estimated_latency_integral_sq);
    out.push(stats.rssi as u8);
    out.extend_from_slice(&[0, 0, 0]); // reserved
    patch_length(out, start);
}

fn parse_sdes_chunks(pkt: &[u8], count: usize) -> Result<Vec<SdesChunk>> {
    let mut chunks = Vec::new();
    let mut offset = 4;
    for _ in 0..count {
        if offset + 4 > pkt.len() {
            return Err(Error::WireFormat("truncated SDES chunk".into()));
        }
        let ssrc = read_u32(pkt, offset);
        offset += 4;
        let mut items = Vec::new();
        loop {
            if offset >= pkt.len() {
                return Err(Error::WireFormat("unterminated SDES item list".into()));
            }
            let ty = pkt[offset];
            offset += 1;
            if ty == 0 {
                // Items are followed by null padding to a 32-bit boundary.
                while offset % 4 != 0 {
                    offset += 1;
                }
                break;
            }
            if offset >= pkt.len() {
                return Err(Error::WireFormat("truncated SDES item".into()));
            }
            let len = pkt[offset] as usize;
            offset += 1;
            if offset + len > pkt.len() {
                return Err(Error::WireFormat("truncated SDES item value".into()));
            }
            let raw = &pkt[offset..offset + len];
            offset += len;
            let Some(item_ty) = SdesItemType::from_u8(ty) else {
                continue;
            };
            if item_ty == SdesItemType::Priv {
                if raw.is_empty() {
                    continue;
                }
                let plen = raw[0] as usize;
                if 1 + plen > raw.len() {
                    continue;
                }
                let prefix = String::from_utf8_lossy(&raw[1..1 + plen]).into_owned();
                let value = String::from_utf8_lossy(&raw[1 + plen..]).into_owned();
                items.push((item_ty, prefix, value));
            } else {
                items.push((item_ty, String::new(), String::from_utf8_lossy(raw).into_owned()));
            }
        }
        chunks.push(SdesChunk { ssrc, items });
    }
    Ok(chunks)
}

fn parse_video_stats(pkt: &[u8]) -> Result<VideoStats> {
    // 12-byte APP header + fixed payload.
    let needed = 12 + 8 + 6 * 4 + MB_STATUS_ZONE_COUNT * 4
        + MB_STATUS_CLASS_COUNT * MB_STATUS_ZONE_COUNT * 4
        + 6 * 8
        + 4;
    if pkt.len() < needed {
        return Err(Error::WireFormat(format!(
            "video stats packet too short: {} < {needed}",
            pkt.len()
        )));
    }
    let mut o = 12;
    let mut stats = VideoStats {
        timestamp_us: read_u64(pkt, o),
        ..Default::default()
    };
    o += 8;
    stats.total_frame_count = read_u32(pkt, o);
    stats.output_frame_count = read_u32(pkt, o + 4);
    stats.errored_output_frame_count = read_u32(pkt, o + 8);
    stats.missed_frame_count = read_u32(pkt, o + 12);
    stats.discarded_frame_count = read_u32(pkt, o + 16);
    stats.errored_second_count = read_u32(pkt, o + 20);
    o += 24;
    for z in 0..MB_STATUS_ZONE_COUNT {
        stats.errored_second_count_by_zone[z] = read_u32(pkt, o);
        o += 4;
    }
    for c in 0..MB_STATUS_CLASS_COUNT {
        for z in 0..MB_STATUS_ZONE_COUNT {
            stats.macroblock_status[c][z] = read_u32(pkt, o);
            o += 4;
        }
    }
    stats.timestamp_delta_integral = read_u64(pkt, o);
    stats.timestamp_delta_integral_sq = read_u64(pkt, o + 8);
    stats.timing_error_integral = read_u64(pkt, o + 16);
    stats.timing_error_integral_sq = read_u64(pkt, o + 24);
    stats.estimated_latency_integral = read_u64(pkt, o + 32);
    stats.estimated_latency_integral_sq = read_u64(pkt, o + 40);
    o += 48;
    stats.rssi = pkt[o] as i8;
    Ok(stats)
}

/// Parse a compound RTCP packet into its constituent packets. Malformed
/// trailing data terminates the walk; already-parsed packets are returned.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        let flags = data[offset];
        let version = (flags >> 6) & 0x03;
        if version != 2 {
            return Err(Error::WireFormat(format!(
                "unsupported RTCP version: {version}"
            )));
        }
        let count = (flags & 0x1F) as usize;
        let pt = data[offset + 1];
        let length_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if offset + packet_len > data.len() {
            return Err(Error::WireFormat("RTCP packet exceeds datagram".into()));
        }
        let pkt = &data[offset..offset + packet_len];

        match pt {
            PT_SR if pkt.len() >= 28 => {
                let sr = SenderReport {
                    ssrc: read_u32(pkt, 4),
                    ntp_timestamp: read_u64(pkt, 8),
                    rtp_timestamp: read_u32(pkt, 16),
                    packet_count: read_u32(pkt, 20),
                    byte_count: read_u32(pkt, 24),
                };
                let report = if count >= 1 && pkt.len() >= 28 + 24 {
                    Some(parse_reception_report(pkt, 28))
                } else {
                    None
                };
                packets.push(RtcpPacket::SenderReport { sr, report });
            }
            PT_RR if pkt.len() >= 8 => {
                let ssrc = read_u32(pkt, 4);
                let report = if count >= 1 && pkt.len() >= 8 + 24 {
                    Some(parse_reception_report(pkt, 8))
                } else {
                    None
                };
                packets.push(RtcpPacket::ReceiverReport(ReceiverReport { ssrc, report }));
            }
            PT_SDES => {
                packets.push(RtcpPacket::Sdes(parse_sdes_chunks(pkt, count)?));
            }
            PT_BYE if pkt.len() >= 8 => {
                let ssrc = read_u32(pkt, 4);
                let reason = if pkt.len() > 8 + count.saturating_sub(1) * 4 {
                    let base = 4 + count * 4;
                    if base < pkt.len() {
                        let rlen = pkt[base] as usize;
                        if base + 1 + rlen <= pkt.len() {
                            Some(String::from_utf8_lossy(&pkt[base + 1..base + 1 + rlen]).into_owned())
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                } else {
                    None
                };
                packets.push(RtcpPacket::Bye(Bye { ssrc, reason }));
            }
            PT_APP if pkt.len() >= 12 => {
                let ssrc = read_u32(pkt, 4);
                let name = read_u32(pkt, 8);
                let subtype = count as u8;
                if name != APP_PACKET_NAME {
                    packets.push(RtcpPacket::Unknown(pt));
                } else {
                    match subtype {
                        APP_SUBTYPE_CLOCK_DELTA if pkt.len() >= 12 + 24 => {
                            packets.push(RtcpPacket::ClockDelta {
                                ssrc,
                                delta: ClockDelta {
                                    originate: read_u64(pkt, 12),
                                    receive: read_u64(pkt, 20),
                                    transmit: read_u64(pkt, 28),
                                },
                            });
                        }
                        APP_SUBTYPE_VIDEO_STATS => {
                            packets.push(RtcpPacket::VideoStats {
                                ssrc,
                                stats: Box::new(parse_video_stats(pkt)?),
                            });
                        }
                        _ => packets.push(RtcpPacket::Unknown(pt)),
                    }
                }
            }
            other => {
                packets.push(RtcpPacket::Unknown(other));
            }
        }

        offset += packet_len;
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_rtcp() {
        let sr = [0x80, 200, 0, 6, 0, 0, 0, 0];
        assert!(is_rtcp(&sr));
        let rtp = [0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(!is_rtcp(&rtp));
    }

    #[test]
    fn test_sr_roundtrip() {
        let sr = SenderReport {
            ssrc: 0x1234_5678,
            ntp_timestamp: 0xAABB_CCDD_0011_2233,
            rtp_timestamp: 90_000,
            packet_count: 100,
            byte_count: 16_000,
        };
        let rb = ReceptionReport {
            ssrc: 0x8765_4321,
            fraction_lost: 12,
            cumulative_lost: 34,
            ext_highest_seq: 0x0001_0002,
            jitter: 56,
            lsr: 0x1111_2222,
            dlsr: 0x0000_8000,
        };
        let mut buf = Vec::new();
        write_sender_report(&mut buf, &sr, Some(&rb));
        assert_eq!(buf.len() % 4, 0);

        let packets = parse_compound(&buf).unwrap();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            RtcpPacket::SenderReport { sr: got, report } => {
                assert_eq!(*got, sr);
                assert_eq!(report.unwrap(), rb);
            }
            other => panic!("expected SR, got {other:?}"),
        }
    }

    #[test]
    fn test_rr_roundtrip_no_block() {
        let rr = ReceiverReport {
            ssrc: 0xAABB_CCDD,
            report: None,
        };
        let mut buf = Vec::new();
        write_receiver_report(&mut buf, &rr);
        let packets = parse_compound(&buf).unwrap();
        assert_eq!(packets[0], RtcpPacket::ReceiverReport(rr));
    }

    #[test]
    fn test_sdes_roundtrip_with_priv() {
        let chunk = SdesChunk {
            ssrc: 0x0102_0304,
            items: vec![
                (SdesItemType::Cname, String::new(), "uav@drone".into()),
                (SdesItemType::Tool, String::new(), "uavlink".into()),
                (SdesItemType::Priv, "link".into(), "wifi0".into()),
            ],
        };
        let mut buf = Vec::new();
        write_sdes(&mut buf, &chunk);
        assert_eq!(buf.len() % 4, 0);
        let packets = parse_compound(&buf).unwrap();
        assert_eq!(packets[0], RtcpPacket::Sdes(vec![chunk]));
    }

    #[test]
    fn test_bye_roundtrip() {
        let bye = Bye {
            ssrc: 0xFEED_F00D,
            reason: Some("teardown".into()),
        };
        let mut buf = Vec::new();
        write_bye(&mut buf, &bye);
        assert_eq!(buf.len() % 4, 0);
        let packets = parse_compound(&buf).unwrap();
        assert_eq!(packets[0], RtcpPacket::Bye(bye));
    }

    #[test]
    fn test_clock_delta_roundtrip() {
        let delta = ClockDelta {
            originate: 1_000_000,
            receive: 2_000_000,
            transmit: 3_000_000,
        };
        let mut buf = Vec::new();
        write_clock_delta(&mut buf, 0x11, &delta);
        let packets = parse_compound(&buf).unwrap();
        assert_eq!(
            packets[0],
            RtcpPacket::ClockDelta {
                ssrc: 0x11,
                delta
            }
        );
    }

    #[test]
    fn test_video_stats_roundtrip() {
        let mut stats = VideoStats {
            timestamp_us: 123_456_789,
            total_frame_count: 300,
            output_frame_count: 290,
            errored_output_frame_count: 5,
            missed_frame_count: 10,
            discarded_frame_count: 2,
            errored_second_count: 3,
            rssi: -42,
            ..Default::default()
        };
        stats.errored_second_count_by_zone[2] = 7;
        stats.macroblock_status[3][4] = 99;
        stats.timing_error_integral = 0x1_0000_0001;

        let mut buf = Vec::new();
        write_video_stats(&mut buf, 0x22, &stats);
        assert_eq!(buf.len() % 4, 0);
        let packets = parse_compound(&buf).unwrap();
        match &packets[0] {
            RtcpPacket::VideoStats { ssrc, stats: got } => {
                assert_eq!(*ssrc, 0x22);
                assert_eq!(**got, stats);
            }
            other => panic!("expected video stats, got {other:?}"),
        }
    }

    #[test]
    fn test_compound_sr_sdes_app() {
        let sr = SenderReport {
            ssrc: 1,
            ntp_timestamp: 2,
            rtp_timestamp: 3,
            packet_count: 4,
            byte_count: 5,
        };
        let chunk = SdesChunk {
            ssrc: 1,
            items: vec![(SdesItemType::Cname, String::new(), "a@b".into())],
        };
        let delta = ClockDelta::default();

        let mut buf = Vec::new();
        write_sender_report(&mut buf, &sr, None);
        write_sdes(&mut buf, &chunk);
        write_clock_delta(&mut buf, 1, &delta);

        let packets = parse_compound(&buf).unwrap();
        assert_eq!(packets.len(), 3);
        assert!(matches!(packets[0], RtcpPacket::SenderReport { .. }));
        assert!(matches!(packets[1], RtcpPacket::Sdes(_)));
        assert!(matches!(packets[2], RtcpPacket::ClockDelta { .. }));
    }

    #[test]
    fn test_truncated_compound_rejected() {
        let sr = SenderReport::default();
        let mut buf = Vec::new();
        write_sender_report(&mut buf, &sr, None);
        buf.truncate(buf.len() - 2);
        assert!(parse_compound(&buf).is_err());
    }
}
