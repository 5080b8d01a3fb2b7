//! H.264 RTP payloading (RFC 6184): NALU FIFO to packet FIFO.
//!
//! Three packetization shapes are chosen per NAL unit:
//! - STAP-A aggregation while small NALs of one access unit fit the
//!   target packet size,
//! - FU-A fragmentation when a NAL exceeds it,
//! - a plain single-NAL packet in between.
//!
//! The marker bit goes on the packet carrying the last NAL of an access
//! unit. Timed-out NALs are not packetized, but the sequence number still
//! advances so the receiver observes the gap.

use bytes::Bytes;

use crate::error::Result;
use crate::fifo::nalu::{NaluDesc, NaluFifo};
use crate::fifo::packet::PacketFifo;
use crate::rtp::{RtpHeader, RtpPacket, RTP_HEADER_SIZE};

use super::{NALU_TYPE_FU_A, NALU_TYPE_STAP_A};

/// Delivery status reported through the sender callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Cancelled,
}

/// One per-packet monitoring event.
#[derive(Debug, Clone, Copy)]
pub struct PacketEvent {
    pub input_time_us: u64,
    pub output_time_us: u64,
    pub ntp_time_us: u64,
    pub rtp_ts: u32,
    pub seq: u16,
    pub marker: bool,
    pub bytes_sent: u32,
    pub bytes_dropped: u32,
}

/// Per-instance sender callbacks (NALU / AU delivery plus monitoring).
pub trait SenderEvents: Send {
    fn nalu_done(&mut self, _status: DeliveryStatus, _nalu_token: u64) {}
    fn au_done(&mut self, _status: DeliveryStatus, _au_token: u64) {}
    fn packet_event(&mut self, _event: &PacketEvent) {}
    /// Link quality digested from the peer's reception reports.
    fn receiver_report(&mut self, _report: &crate::rtcp::state::LinkReport) {}
}

/// No-op event sink.
pub struct NullEvents;
impl SenderEvents for NullEvents {}

#[derive(Debug)]
struct StapState {
    payload: Vec<u8>,
    max_nri: u8,
    importance: u8,
    priority: u8,
    ntp_time_us: u64,
    input_time_us: u64,
    timeout_time_us: u64,
    seq_gap: u16,
    metadata: Option<Bytes>,
}

/// Sender-side payloading state.
pub struct Payloader {
    pub ssrc: u32,
    pub rtp_clock_rate: u32,
    pub rtp_ts_offset: u32,
    /// Maximum UDP payload per packet, RTP header included.
    pub max_packet_size: usize,
    /// Preferred packet size the link scheduler aims for.
    pub target_packet_size: usize,
    pub use_header_extensions: bool,

    seq: u16,
    packet_count: u32,
    byte_count: u32,

    previous_ntp_us: u64,
    previous_au_token: u64,
    last_au_cb_ntp_us: u64,
    stap: Option<StapState>,
}

impl Payloader {
    pub fn new(
        ssrc: u32,
        rtp_clock_rate: u32,
        rtp_ts_offset: u32,
        max_packet_size: usize,
        target_packet_size: usize,
        use_header_extensions: bool,
    ) -> Self {
        Self {
            ssrc,
            rtp_clock_rate,
            rtp_ts_offset,
            max_packet_size,
            target_packet_size,
            use_header_extensions,
            seq: 0,
            packet_count: 0,
            byte_count: 0,
            previous_ntp_us: 0,
            previous_au_token: 0,
            last_au_cb_ntp_us: 0,
            stap: None,
        }
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn byte_count(&self) -> u32 {
        self.byte_count
    }

    pub fn next_seq(&self) -> u16 {
        self.seq
    }

    fn rtp_ts(&self, ntp_us: u64) -> u32 {
        (((ntp_us * self.rtp_clock_rate as u64 + 500_000) / 1_000_000)
            + self.rtp_ts_offset as u64) as u32
    }

    /// Payload budget of one packet, excluding the RTP header and an
    /// optional extension block.
    fn payload_budget(&self, base: usize, ext_len: usize) -> usize {
        base.saturating_sub(RTP_HEADER_SIZE + ext_len)
    }

    fn metadata_of(&self, nalu: &NaluDesc) -> Option<Bytes> {
        if self.use_header_extensions {
            nalu.metadata.clone()
        } else {
            None
        }
    }

    /// Move every queued NAL unit into the packet FIFO.
    pub fn drain(
        &mut self,
        nalu_fifo: &mut NaluFifo,
        packet_fifo: &mut PacketFifo,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) -> Result<()> {
        while let Some(nalu) = nalu_fifo.pop() {
            // Access unit boundary: flush aggregation and report the
            // previous AU if its last NALU never announced itself.
            if self.previous_ntp_us != 0 && nalu.ntp_time_us != self.previous_ntp_us {
                if self.stap.is_some() {
                    self.finish_stap(packet_fifo, false, now_us, events);
                }
                if self.previous_ntp_us != self.last_au_cb_ntp_us {
                    self.last_au_cb_ntp_us = self.previous_ntp_us;
                    events.au_done(DeliveryStatus::Sent, self.previous_au_token);
                }
            }

            let timed_out = nalu.timeout_time_us != 0 && nalu.timeout_time_us <= now_us;
            if timed_out {
                self.drop_nalu(&nalu, now_us, events);
                events.nalu_done(DeliveryStatus::Cancelled, nalu.nalu_token);
            } else {
                self.packetize(&nalu, packet_fifo, now_us, events);
                events.nalu_done(DeliveryStatus::Sent, nalu.nalu_token);
            }

            if nalu.is_last_in_au && nalu.ntp_time_us != self.last_au_cb_ntp_us {
                self.last_au_cb_ntp_us = nalu.ntp_time_us;
                events.au_done(DeliveryStatus::Sent, nalu.au_token);
            }

            self.previous_ntp_us = nalu.ntp_time_us;
            self.previous_au_token = nalu.au_token;
        }
        Ok(())
    }

    /// Cancel everything still queued (stop path).
    pub fn flush(
        &mut self,
        nalu_fifo: &mut NaluFifo,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) -> usize {
        let mut count = 0;
        for nalu in nalu_fifo.drain() {
            count += 1;
            self.drop_nalu(&nalu, now_us, events);
            events.nalu_done(DeliveryStatus::Cancelled, nalu.nalu_token);
            if nalu.is_last_in_au && nalu.ntp_time_us != self.last_au_cb_ntp_us {
                self.last_au_cb_ntp_us = nalu.ntp_time_us;
                events.au_done(DeliveryStatus::Sent, nalu.au_token);
            }
        }
        count
    }

    /// Account a dropped NALU: the sequence number still advances so the
    /// receiver sees the gap, and monitoring records the dropped bytes.
    fn drop_nalu(&mut self, nalu: &NaluDesc, now_us: u64, events: &mut dyn SenderEvents) {
        tracing::warn!(
            "dropped late NALU ({:.1}ms past deadline, seq {})",
            (now_us.saturating_sub(nalu.timeout_time_us)) as f64 / 1000.0,
            self.seq
        );
        self.seq = self.seq.wrapping_add(nalu.seq_gap_before + 1);
        self.packet_count += nalu.seq_gap_before as u32 + 1;
        self.byte_count += nalu.payload.len() as u32;
        events.packet_event(&PacketEvent {
            input_time_us: nalu.input_time_us,
            output_time_us: now_us,
            ntp_time_us: nalu.ntp_time_us,
            rtp_ts: self.rtp_ts(nalu.ntp_time_us),
            seq: self.seq.wrapping_sub(1),
            marker: nalu.is_last_in_au,
            bytes_sent: 0,
            bytes_dropped: nalu.payload.len() as u32,
        });
    }

    fn packetize(
        &mut self,
        nalu: &NaluDesc,
        packet_fifo: &mut PacketFifo,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) {
        let meta_len = self.metadata_of(nalu).map(|m| m.len()).unwrap_or(0);

        // Fragmentation applies once the NAL no longer fits one packet.
        if nalu.payload.len() + 2 > self.payload_budget(self.max_packet_size, 0) {
            let fragment_count = ((nalu.payload.len() + meta_len + self.target_packet_size - 1)
                / self.target_packet_size)
                .max(2);
            if self.stap.is_some() {
                self.finish_stap(packet_fifo, false, now_us, events);
            }
            self.emit_fua(nalu, fragment_count, packet_fifo, now_us, events);
            return;
        }

        // Size this NAL would add to a STAP-A (a fresh one pays for the
        // RTP header, the extension and the STAP-A type byte).
        let fresh = self.stap.is_none();
        let new_stap_size =
            if fresh { RTP_HEADER_SIZE + meta_len + 1 } else { 0 } + 2 + nalu.payload.len();
        let current = self
            .stap
            .as_ref()
            .map(|s| RTP_HEADER_SIZE + s.metadata.as_ref().map(|m| m.len()).unwrap_or(0) + s.payload.len())
            .unwrap_or(0);

        let over_budget = current + new_stap_size >= self.max_packet_size
            || current + new_stap_size > self.target_packet_size;

        if (over_budget || nalu.seq_gap_before > 0) && self.stap.is_some() {
            // A forced discontinuity must begin a new packet.
            self.finish_stap(packet_fifo, false, now_us, events);
        }

        let fresh_size = RTP_HEADER_SIZE + meta_len + 1 + 2 + nalu.payload.len();
        if fresh_size >= self.max_packet_size || fresh_size > self.target_packet_size {
            self.emit_single(nalu, packet_fifo, now_us, events);
            return;
        }

        if self.stap.is_none() {
            self.stap = Some(StapState {
                payload: vec![0u8], // STAP-A type byte, patched at finish
                max_nri: 0,
                importance: 0,
                priority: 0,
                ntp_time_us: nalu.ntp_time_us,
                input_time_us: nalu.input_time_us,
                timeout_time_us: nalu.timeout_time_us,
                seq_gap: nalu.seq_gap_before,
                metadata: self.metadata_of(nalu),
            });
        }
        let stap = self.stap.as_mut().expect("just created");
        let nri = (nalu.payload[0] >> 5) & 0x3;
        stap.max_nri = stap.max_nri.max(nri);
        // Lowest nonzero importance/priority wins for the aggregate.
        if stap.importance == 0 || (nalu.importance != 0 && nalu.importance < stap.importance) {
            stap.importance = nalu.importance;
        }
        if stap.priority == 0 || (nalu.priority != 0 && nalu.priority < stap.priority) {
            stap.priority = nalu.priority;
        }
        stap.payload
            .extend_from_slice(&(nalu.payload.len() as u16).to_be_bytes());
        stap.payload.extend_from_slice(&nalu.payload);

        if nalu.is_last_in_au {
            self.finish_stap(packet_fifo, true, now_us, events);
        }
    }

    fn acquire_packet(&mut self, packet_fifo: &mut PacketFifo) -> Option<RtpPacket> {
        match packet_fifo.acquire() {
            Ok(p) => Some(p),
            Err(_) => {
                let flushed = packet_fifo.flush(|_| {});
                tracing::error!("packet FIFO full, flushed {flushed} packets to recover");
                packet_fifo.acquire().ok()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_packet(
        &mut self,
        packet_fifo: &mut PacketFifo,
        payload: &[u8],
        metadata: Option<&Bytes>,
        ntp_time_us: u64,
        input_time_us: u64,
        timeout_time_us: u64,
        seq_gap: u16,
        marker: bool,
        importance: u8,
        priority: u8,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) {
        let Some(mut packet) = self.acquire_packet(packet_fifo) else {
            return;
        };
        self.seq = self.seq.wrapping_add(seq_gap);
        let rtp_ts = self.rtp_ts(ntp_time_us);
        let header = RtpHeader::new(marker, self.seq, rtp_ts, self.ssrc, false);
        let ext = metadata.map(|m| m.as_ref());
        if let Err(e) = packet.build(header, ext, payload) {
            tracing::error!("failed to build RTP packet: {e}");
            packet_fifo.release(packet);
            return;
        }
        packet.input_time_us = input_time_us;
        packet.timeout_time_us = timeout_time_us;
        packet.ntp_time_us = ntp_time_us;
        packet.ext_rtp_ts = rtp_ts as u64;
        packet.ext_seq = self.seq as u32;
        packet.importance = importance;
        packet.priority = priority;

        self.packet_count += seq_gap as u32 + 1;
        self.byte_count += payload.len() as u32;
        events.packet_event(&PacketEvent {
            input_time_us,
            output_time_us: now_us,
            ntp_time_us,
            rtp_ts,
            seq: self.seq,
            marker,
            bytes_sent: payload.len() as u32,
            bytes_dropped: 0,
        });
        self.seq = self.seq.wrapping_add(1);
        packet_fifo.enqueue(packet);
    }

    fn emit_single(
        &mut self,
        nalu: &NaluDesc,
        packet_fifo: &mut PacketFifo,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) {
        let metadata = self.metadata_of(nalu);
        let payload = nalu.payload.clone();
        self.emit_packet(
            packet_fifo,
            &payload,
            metadata.as_ref(),
            nalu.ntp_time_us,
            nalu.input_time_us,
            nalu.timeout_time_us,
            nalu.seq_gap_before,
            nalu.is_last_in_au,
            nalu.importance,
            nalu.priority,
            now_us,
            events,
        );
    }

    fn emit_fua(
        &mut self,
        nalu: &NaluDesc,
        fragment_count: usize,
        packet_fifo: &mut PacketFifo,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) {
        let header_byte = nalu.payload[0];
        let fu_indicator = (header_byte & 0xE0) | NALU_TYPE_FU_A;
        let fu_type = header_byte & 0x1F;
        let body = &nalu.payload[1..];
        let meta_len = self.metadata_of(nalu).map(|m| m.len()).unwrap_or(0);
        let max_chunk = self
            .payload_budget(self.max_packet_size, 0)
            .saturating_sub(2)
            .max(1);

        // Balanced fragment sizes: the mean over the fragment count, the
        // last fragment absorbing the rounding remainder. The first
        // fragment gives room to the header extension.
        let mean = (nalu.payload.len() + meta_len + fragment_count / 2) / fragment_count;
        let mut sizes = Vec::with_capacity(fragment_count);
        let mut remaining = body.len();
        for i in 0..fragment_count {
            let take = if i == fragment_count - 1 {
                remaining
            } else {
                let reserve = if i == 0 { meta_len } else { 0 };
                mean.saturating_sub(reserve).clamp(1, remaining)
            };
            sizes.push(take);
            remaining -= take;
            if remaining == 0 && i < fragment_count - 1 {
                break;
            }
        }

        let total_fragments = sizes.len();
        let mut offset = 0usize;
        let mut metadata = self.metadata_of(nalu);
        for (i, &fragment_size) in sizes.iter().enumerate() {
            let mut fragment_offset = 0usize;
            loop {
                let chunk = (fragment_size - fragment_offset).min(max_chunk);
                let start = offset == 0;
                let end = i == total_fragments - 1 && fragment_offset + chunk == fragment_size;

                let mut payload = Vec::with_capacity(2 + chunk);
                payload.push(fu_indicator);
                payload.push(fu_type | if start { 0x80 } else { 0 } | if end { 0x40 } else { 0 });
                payload.extend_from_slice(&body[offset..offset + chunk]);

                let seq_gap = if start { nalu.seq_gap_before } else { 0 };
                let marker = nalu.is_last_in_au && end;
                let meta = if start { metadata.take() } else { None };
                self.emit_packet(
                    packet_fifo,
                    &payload,
                    meta.as_ref(),
                    nalu.ntp_time_us,
                    nalu.input_time_us,
                    nalu.timeout_time_us,
                    seq_gap,
                    marker,
                    nalu.importance,
                    nalu.priority,
                    now_us,
                    events,
                );

                fragment_offset += chunk;
                offset += chunk;
                if fragment_offset >= fragment_size {
                    break;
                }
            }
        }
    }

    fn finish_stap(
        &mut self,
        packet_fifo: &mut PacketFifo,
        marker: bool,
        now_us: u64,
        events: &mut dyn SenderEvents,
    ) {
        let Some(mut stap) = self.stap.take() else {
            return;
        };
        stap.payload[0] = NALU_TYPE_STAP_A | ((stap.max_nri & 0x3) << 5);
        let payload = std::mem::take(&mut stap.payload);
        self.emit_packet(
            packet_fifo,
            &payload,
            stap.metadata.as_ref(),
            stap.ntp_time_us,
            stap.input_time_us,
            stap.timeout_time_us,
            stap.seq_gap,
            marker,
            stap.importance,
            stap.priority,
            now_us,
            events,
        );
    }
}
