//! H.264 RTP depayloading (RFC 6184): packet FIFO to access units.
//!
//! Packets are consumed from the ordered FIFO head strictly by extended
//! sequence number; a packet is taken out of order only once its timeout
//! has expired, trading a late picture for unbounded head-of-line
//! blocking. FU-A reassembly rolls the partial NAL back out of the AU
//! buffer when a fragment goes missing, so a half NAL never reaches the
//! decoder.

use crate::fifo::au::{AuAssembly, AuBufferPool, NaluInfo};
use crate::fifo::packet::PacketFifo;
use crate::rtcp::state::ReceiverRtcpContext;
use crate::rtp::RtpPacket;

use super::{NaluType, SliceType, NALU_TYPE_FU_A, NALU_TYPE_STAP_A, START_CODE};

#[derive(Debug)]
struct FuState {
    /// Offset of the partial NAL (start code included) in the AU buffer.
    nalu_offset: usize,
    nalu_type: NaluType,
    missing_packets_before: u32,
}

/// Receiver-side depayloading state.
pub struct Depayloader {
    /// Prepend an Annex-B start code to every reconstructed NAL unit.
    pub use_start_codes: bool,
    pub rtp_clock_rate: u32,

    prev_ext_seq: Option<u32>,
    prev_ext_ts: Option<u64>,
    fu: Option<FuState>,
    current: Option<AuAssembly>,
    current_has_gap: bool,
}

impl Depayloader {
    pub fn new(rtp_clock_rate: u32) -> Self {
        Self {
            use_start_codes: true,
            rtp_clock_rate,
            prev_ext_seq: None,
            prev_ext_ts: None,
            fu: None,
            current: None,
            current_has_gap: false,
        }
    }

    /// Drain every packet whose predecessors have arrived or whose
    /// timeout has expired, producing completed access-unit assemblies.
    pub fn process(
        &mut self,
        packet_fifo: &mut PacketFifo,
        pool: &mut AuBufferPool,
        rtcp: &mut ReceiverRtcpContext,
        now_us: u64,
    ) -> Vec<AuAssembly> {
        let mut completed = Vec::new();

        loop {
            let ready = match packet_fifo.peek_head() {
                None => break,
                Some(head) => match self.prev_ext_seq {
                    None => true,
                    Some(prev) => {
                        head.ext_seq == prev.wrapping_add(1)
                            || (head.timeout_time_us != 0 && now_us >= head.timeout_time_us)
                    }
                },
            };
            if !ready {
                break;
            }
            let packet = packet_fifo.pop_head().expect("peeked head");

            let seq_delta = match self.prev_ext_seq {
                None => 1,
                Some(prev) => packet.ext_seq.wrapping_sub(prev),
            };
            if seq_delta > 1 {
                rtcp.packets_lost += seq_delta - 1;
                tracing::debug!(
                    "sequence gap of {} before ext seq {}",
                    seq_delta - 1,
                    packet.ext_seq
                );
            }

            // RTP timestamp change closes the pending access unit.
            if let (Some(prev_ts), Some(_)) = (self.prev_ext_ts, self.current.as_ref()) {
                if packet.ext_rtp_ts != prev_ts {
                    self.abort_fu();
                    if let Some(au) = self.take_current(rtcp) {
                        completed.push(au);
                    }
                }
            }

            if self.current.is_none() {
                match pool.acquire() {
                    Ok(buf) => {
                        let mut asm = AuAssembly::new(buf);
                        asm.ext_rtp_ts = packet.ext_rtp_ts;
                        asm.rtp_ts = packet.header.timestamp;
                        asm.ntp_time_raw_us =
                            packet.ext_rtp_ts * 1_000_000 / self.rtp_clock_rate as u64;
                        asm.ntp_time_local_us = packet.input_time_us;
                        self.current = Some(asm);
                        self.current_has_gap = false;
                    }
                    Err(_) => {
                        tracing::error!("AU buffer pool exhausted, dropping packet");
                        packet_fifo.drop_stats.record(packet.importance, packet.len);
                        self.note_seq(&packet, rtcp);
                        packet_fifo.release(packet);
                        continue;
                    }
                }
            }

            self.depayload_packet(&packet, seq_delta - 1);

            if packet.header.marker {
                self.abort_fu();
                if let Some(mut au) = self.take_current(rtcp) {
                    au.ended_on_marker = true;
                    completed.push(au);
                }
            }

            self.note_seq(&packet, rtcp);
            packet_fifo.release(packet);
        }

        completed
    }

    /// Flush the pending access unit (stop path).
    pub fn flush(&mut self, rtcp: &mut ReceiverRtcpContext) -> Option<AuAssembly> {
        self.abort_fu();
        self.take_current(rtcp)
    }

    /// Extended sequence number of the last consumed packet; packets at
    /// or below it arrive too late to be of use.
    pub fn last_consumed_seq(&self) -> Option<u32> {
        self.prev_ext_seq
    }

    fn note_seq(&mut self, packet: &RtpPacket, rtcp: &mut ReceiverRtcpContext) {
        rtcp.packets_received += 1;
        self.prev_ext_seq = Some(packet.ext_seq);
        self.prev_ext_ts = Some(packet.ext_rtp_ts);
    }

    fn take_current(&mut self, rtcp: &ReceiverRtcpContext) -> Option<AuAssembly> {
        let mut au = self.current.take()?;
        if au.nalu_count() == 0 {
            // Nothing survived (e.g. a lone aborted FU-A); recycle.
            return None;
        }
        let mapped = rtcp.ntp_us_from_rtp(au.ext_rtp_ts);
        au.ntp_time_us = if mapped != 0 { mapped } else { au.ntp_time_raw_us };
        au.has_errors = self.current_has_gap;
        Some(au)
    }

    fn depayload_packet(&mut self, packet: &RtpPacket, missing_before: u32) {
        let payload = packet.payload();
        if payload.is_empty() {
            tracing::debug!("empty RTP payload at ext seq {}", packet.ext_seq);
            return;
        }
        if missing_before > 0 {
            self.current_has_gap = true;
        }

        // Vendor telemetry travels as the header extension and overwrites
        // the AU metadata slot.
        if let (Some(ext), Some(au)) = (packet.extension(), self.current.as_mut()) {
            au.set_metadata(ext);
        }

        match payload[0] & 0x1F {
            NALU_TYPE_FU_A => self.depayload_fua(packet, payload, missing_before),
            NALU_TYPE_STAP_A => {
                self.abort_fu();
                self.depayload_stapa(payload, missing_before);
            }
            _ => {
                self.abort_fu();
                self.append_nalu(payload, missing_before);
            }
        }
    }

    fn append_nalu(&mut self, nalu: &[u8], missing_before: u32) {
        let Some(au) = self.current.as_mut() else {
            return;
        };
        let offset = au.data_len();
        if self.use_start_codes {
            au.append(&START_CODE);
        }
        au.append(nalu);
        au.push_nalu(NaluInfo {
            offset,
            len: au.data_len() - offset,
            nalu_type: NaluType::from_header(nalu[0]),
            slice_type: SliceType::Unknown,
            missing_packets_before: missing_before,
            is_last_in_au: false,
        });
    }

    fn depayload_stapa(&mut self, payload: &[u8], missing_before: u32) {
        let mut offset = 1usize; // skip the STAP-A type byte
        let mut first = true;
        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                if size != 0 {
                    tracing::debug!(
                        "STAP-A NAL size {size} exceeds payload ({} bytes left)",
                        payload.len() - offset
                    );
                    self.current_has_gap = true;
                }
                break;
            }
            self.append_nalu(
                &payload[offset..offset + size],
                if first { missing_before } else { 0 },
            );
            offset += size;
            first = false;
        }
    }

    fn depayload_fua(&mut self, packet: &RtpPacket, payload: &[u8], missing_before: u32) {
        if payload.len() < 2 {
            tracing::debug!("runt FU-A packet at ext seq {}", packet.ext_seq);
            return;
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let reconstructed = (fu_indicator & 0xE0) | (fu_header & 0x1F);

        if self.fu.is_some() && start {
            tracing::debug!("FU-A restarted before completion at ext seq {}", packet.ext_seq);
            self.abort_fu();
        }

        if start {
            let Some(au) = self.current.as_mut() else {
                return;
            };
            let nalu_offset = au.data_len();
            if self.use_start_codes {
                au.append(&START_CODE);
            }
            au.append(&[reconstructed]);
            au.append(&payload[2..]);
            self.fu = Some(FuState {
                nalu_offset,
                nalu_type: NaluType::from_header(reconstructed),
                missing_packets_before: missing_before,
            });
        } else if missing_before > 0 {
            // A gap mid-fragmentation invalidates the whole NAL.
            tracing::debug!("FU-A broken by sequence gap at ext seq {}", packet.ext_seq);
            self.abort_fu();
        } else if self.fu.is_some() {
            let au = self.current.as_mut().expect("AU present while FU pending");
            au.append(&payload[2..]);
        }

        if end {
            if let Some(fu) = self.fu.take() {
                let au = self.current.as_mut().expect("AU present while FU pending");
                au.push_nalu(NaluInfo {
                    offset: fu.nalu_offset,
                    len: au.data_len() - fu.nalu_offset,
                    nalu_type: fu.nalu_type,
                    slice_type: SliceType::Unknown,
                    missing_packets_before: fu.missing_packets_before,
                    is_last_in_au: false,
                });
            }
        }
    }

    /// Roll a pending partial FU-A NAL back out of the AU buffer.
    fn abort_fu(&mut self) {
        if let Some(fu) = self.fu.take() {
            self.current_has_gap = true;
            if let Some(au) = self.current.as_mut() {
                au.truncate(fu.nalu_offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::au::AuPoolConfig;
    use crate::fifo::nalu::NaluDesc;
    use crate::fifo::nalu::NaluFifo;
    use crate::h264::payloader::{NullEvents, Payloader};
    use crate::rtp::ext;
    use bytes::Bytes;

    fn pool() -> AuBufferPool {
        AuBufferPool::new(AuPoolConfig {
            slots: 8,
            data_capacity: 64 * 1024,
            metadata_capacity: 256,
            sidecar_capacity: 1024,
        })
        .unwrap()
    }

    fn rtcp() -> ReceiverRtcpContext {
        ReceiverRtcpContext::new(1, 90_000, 1000, "r@gcs")
    }

    /// Run NALUs through the payloader and feed the produced packets to
    /// a depayloader, returning the completed assemblies.
    fn roundtrip(
        submissions: Vec<(Vec<u8>, u64, bool)>,
        max: usize,
        target: usize,
    ) -> (Vec<AuAssembly>, ReceiverRtcpContext) {
        let mut payloader = Payloader::new(7, 90_000, 0, max, target, true);
        let mut nalus = NaluFifo::new(64).unwrap();
        let mut packets = PacketFifo::new(64, 2048).unwrap();
        for (body, ntp, last) in submissions {
            let mut d = NaluDesc::new(Bytes::from(body), ntp);
            d.is_last_in_au = last;
            nalus.push(d).unwrap();
        }
        payloader
            .drain(&mut nalus, &mut packets, 0, &mut NullEvents)
            .unwrap();

        // Reframe through a receive FIFO in order.
        let mut rx_fifo = PacketFifo::new(64, 2048).unwrap();
        while let Some(p) = packets.pop_head() {
            let mut rx = rx_fifo.acquire().unwrap();
            rx.buffer[..p.len].copy_from_slice(p.bytes());
            rx.parse_into(p.len).unwrap();
            rx.ext_seq = rx.header.seq as u32;
            rx.ext_rtp_ts = rx.header.timestamp as u64;
            rx_fifo.enqueue_ordered(rx);
        }

        let mut depay = Depayloader::new(90_000);
        let mut ctx = rtcp();
        let mut pool = pool();
        let mut out = depay.process(&mut rx_fifo, &mut pool, &mut ctx, 0);
        if let Some(tail) = depay.flush(&mut ctx) {
            out.push(tail);
        }
        (out, ctx)
    }

    #[test]
    fn test_single_nal_roundtrip() {
        let mut body = vec![0x65u8];
        body.extend(vec![0x42; 599]);
        let (aus, _) = roundtrip(vec![(body.clone(), 1_000_000, true)], 1400, 1200);
        assert_eq!(aus.len(), 1);
        let au = &aus[0];
        assert_eq!(au.nalus.len(), 1);
        let nalu = au.nalu_bytes(&au.nalus[0]);
        assert_eq!(&nalu[..4], &START_CODE);
        assert_eq!(&nalu[4..], &body[..]);
        assert_eq!(au.data_len(), 604);
    }

    #[test]
    fn test_fua_reassembly_byte_exact() {
        let mut body = vec![0x65u8];
        body.extend((0..4999u32).map(|i| (i * 7 % 256) as u8));
        let (aus, _) = roundtrip(vec![(body.clone(), 1_000_000, true)], 1400, 1200);
        assert_eq!(aus.len(), 1);
        let au = &aus[0];
        assert_eq!(au.nalus.len(), 1);
        assert_eq!(au.nalus[0].nalu_type, NaluType::SliceIdr);
        let nalu = au.nalu_bytes(&au.nalus[0]);
        assert_eq!(&nalu[4..], &body[..]);
    }

    #[test]
    fn test_stapa_split_into_nals() {
        let mut subs = Vec::new();
        for i in 0..4u8 {
            let mut body = vec![0x41u8];
            body.extend(vec![i; 99]);
            subs.push((body, 2_000_000, i == 3));
        }
        let (aus, _) = roundtrip(subs, 1400, 700);
        assert_eq!(aus.len(), 1);
        let au = &aus[0];
        assert_eq!(au.nalus.len(), 4);
        for (i, info) in au.nalus.iter().enumerate() {
            let nalu = au.nalu_bytes(info);
            assert_eq!(nalu.len(), 4 + 100);
            assert_eq!(nalu[5], i as u8);
        }
    }

    #[test]
    fn test_au_boundary_on_timestamp_change() {
        let (aus, _) = roundtrip(
            vec![
                (vec![0x41u8; 100], 1_000_000, false), // AU 1, no marker
                (vec![0x41u8; 100], 1_033_333, true),  // AU 2
            ],
            1400,
            1200,
        );
        assert_eq!(aus.len(), 2);
        assert_ne!(aus[0].ext_rtp_ts, aus[1].ext_rtp_ts);
    }

    fn make_packet(
        fifo: &mut PacketFifo,
        seq: u32,
        ts: u64,
        marker: bool,
        payload: &[u8],
    ) -> RtpPacket {
        let mut p = fifo.acquire().unwrap();
        let header = crate::rtp::RtpHeader::new(marker, seq as u16, ts as u32, 7, false);
        p.build(header, None, payload).unwrap();
        p.ext_seq = seq;
        p.ext_rtp_ts = ts;
        p
    }

    #[test]
    fn test_fua_dropped_on_gap_mid_fragment() {
        let mut fifo = PacketFifo::new(16, 1500).unwrap();
        let mut depay = Depayloader::new(90_000);
        let mut ctx = rtcp();
        let mut pool = pool();

        // FU-A start (seq 0), then a gap (seq 2 is a middle fragment),
        // then a complete single NAL with the marker (seq 3).
        let start = [0x7C, 0x85, 0xAA, 0xAB];
        let middle = [0x7C, 0x05, 0xAC, 0xAD];
        let single = [0x65, 0x01, 0x02];
        let p0 = make_packet(&mut fifo, 0, 9000, false, &start);
        fifo.enqueue_ordered(p0);
        let mut p2 = make_packet(&mut fifo, 2, 9000, false, &middle);
        p2.timeout_time_us = 10; // expired so it is taken despite the gap
        fifo.enqueue_ordered(p2);
        let mut p3 = make_packet(&mut fifo, 3, 9000, true, &single);
        p3.timeout_time_us = 10;
        fifo.enqueue_ordered(p3);

        let aus = depay.process(&mut fifo, &mut pool, &mut ctx, 1_000);
        assert_eq!(aus.len(), 1);
        let au = &aus[0];
        // The partial FU-A was rolled back; only the single NAL remains.
        assert_eq!(au.nalus.len(), 1);
        assert_eq!(au.nalu_bytes(&au.nalus[0])[4..], single);
        assert!(au.has_errors);
        assert_eq!(ctx.packets_lost, 1);
        assert_eq!(ctx.packets_received, 3);
    }

    #[test]
    fn test_out_of_order_head_waits_for_predecessor() {
        let mut fifo = PacketFifo::new(16, 1500).unwrap();
        let mut depay = Depayloader::new(90_000);
        let mut ctx = rtcp();
        let mut pool = pool();

        let p0 = make_packet(&mut fifo, 0, 9000, false, &[0x41, 0x01]);
        fifo.enqueue_ordered(p0);
        let mut p2 = make_packet(&mut fifo, 2, 9000, true, &[0x41, 0x03]);
        p2.timeout_time_us = 1_000_000; // not yet expired
        fifo.enqueue_ordered(p2);

        let aus = depay.process(&mut fifo, &mut pool, &mut ctx, 0);
        assert!(aus.is_empty());
        assert_eq!(fifo.len(), 1); // seq 2 still waiting for seq 1

        // The missing packet arrives; everything drains.
        let p1 = make_packet(&mut fifo, 1, 9000, false, &[0x41, 0x02]);
        fifo.enqueue_ordered(p1);
        let aus = depay.process(&mut fifo, &mut pool, &mut ctx, 0);
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].nalus.len(), 3);
        assert!(!aus[0].has_errors);
        assert_eq!(ctx.packets_lost, 0);
    }

    #[test]
    fn test_metadata_extension_copied_to_au() {
        let mut fifo = PacketFifo::new(16, 1500).unwrap();
        let mut depay = Depayloader::new(90_000);
        let mut ctx = rtcp();
        let mut pool = pool();

        let mut ext_block = Vec::new();
        ext::write(&mut ext_block, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut p = fifo.acquire().unwrap();
        let header = crate::rtp::RtpHeader::new(true, 0, 9000, 7, false);
        p.build(header, Some(&ext_block), &[0x65, 0x11]).unwrap();
        p.ext_seq = 0;
        p.ext_rtp_ts = 9000;
        fifo.enqueue_ordered(p);

        let aus = depay.process(&mut fifo, &mut pool, &mut ctx, 0);
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].buffer().metadata, ext_block);
    }

    #[test]
    fn test_packet_fifo_balanced_after_drain() {
        let mut body = vec![0x65u8];
        body.extend(vec![0x42; 3000]);
        let (aus, ctx) = roundtrip(vec![(body, 1_000_000, true)], 1400, 1200);
        assert_eq!(aus.len(), 1);
        assert!(ctx.packets_received > 1);
    }
}
