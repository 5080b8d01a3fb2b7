//! RTP packet encoding/decoding and extended counter reconstruction.
//!
//! RTP header format (RFC 3550):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The 16-bit sequence number and 32-bit timestamp wrap quickly at video
//! rates, so the receive path reconstructs extended counters (32-bit
//! sequence, 64-bit timestamp) relative to the highest value seen.

pub mod ext;

use crate::error::{Error, Result};

/// RTP header size in bytes (no CSRC list is ever emitted).
pub const RTP_HEADER_SIZE: usize = 12;

/// Dynamic payload type carried by every stream packet.
pub const PT_H264: u8 = 96;

/// Video RTP clock rate (90 kHz per RFC 3551).
pub const CLOCK_RATE: u32 = 90_000;

/// Well-known SSRC of the airborne sender.
pub const SENDER_SSRC: u32 = 0x5541_5653;
/// Well-known SSRC of the ground receiver.
pub const RECEIVER_SSRC: u32 = 0x5541_5652;

/// Generate a random SSRC via the OS CSPRNG.
pub fn generate_ssrc() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
    u32::from_be_bytes(buf)
}

/// Random RTP timestamp offset for a new session (16-bit range keeps the
/// NTP-derived timestamps readable in traces).
pub fn generate_rtp_ts_offset() -> u32 {
    let mut buf = [0u8; 2];
    getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
    u16::from_be_bytes(buf) as u32
}

/// Parsed RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub seq: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(marker: bool, seq: u16, timestamp: u32, ssrc: u32, extension: bool) -> Self {
        Self {
            padding: false,
            extension,
            csrc_count: 0,
            marker,
            payload_type: PT_H264,
            seq,
            timestamp,
            ssrc,
        }
    }

    /// Serialize into the first 12 bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(Error::BadParameters("RTP header buffer too small".into()));
        }
        buf[0] = 0x80
            | if self.padding { 0x20 } else { 0 }
            | if self.extension { 0x10 } else { 0 }
            | (self.csrc_count & 0x0F);
        buf[1] = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        Ok(())
    }

    /// Parse the fixed header from raw packet bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(Error::WireFormat(format!(
                "RTP packet too short: {} bytes",
                data.len()
            )));
        }
        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            return Err(Error::WireFormat(format!(
                "unsupported RTP version: {version}"
            )));
        }
        Ok(Self {
            padding: (data[0] >> 5) & 0x01 != 0,
            extension: (data[0] >> 4) & 0x01 != 0,
            csrc_count: data[0] & 0x0F,
            marker: (data[1] >> 7) & 0x01 != 0,
            payload_type: data[1] & 0x7F,
            seq: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Reconstructs a 32-bit extended sequence number from the 16-bit wire
/// field by tracking wraparounds against the highest value seen.
#[derive(Debug, Default, Clone)]
pub struct ExtSeqTracker {
    ext_highest: u32,
    initialized: bool,
}

impl ExtSeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend a 16-bit sequence number. Correct as long as reordering
    /// stays within 2^15 of the highest sequence seen.
    pub fn extend(&mut self, seq: u16) -> u32 {
        if !self.initialized {
            self.initialized = true;
            self.ext_highest = seq as u32;
            return self.ext_highest;
        }
        let mut ext = (self.ext_highest & !0xFFFF) | seq as u32;
        let diff = ext as i64 - self.ext_highest as i64;
        if diff < -(1 << 15) {
            ext = ext.wrapping_add(1 << 16);
        } else if diff > (1 << 15) {
            // Late packet from before a wrap.
            ext = ext.wrapping_sub(1 << 16);
        }
        if ext > self.ext_highest {
            self.ext_highest = ext;
        }
        ext
    }

    pub fn highest(&self) -> u32 {
        self.ext_highest
    }
}

/// 64-bit extension of the 32-bit RTP timestamp; wrap threshold 2^31.
#[derive(Debug, Default, Clone)]
pub struct ExtTsTracker {
    ext_highest: u64,
    initialized: bool,
}

impl ExtTsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, ts: u32) -> u64 {
        if !self.initialized {
            self.initialized = true;
            self.ext_highest = ts as u64;
            return self.ext_highest;
        }
        let mut ext = (self.ext_highest & !0xFFFF_FFFF) | ts as u64;
        let diff = ext as i128 - self.ext_highest as i128;
        if diff < -(1i128 << 31) {
            ext = ext.wrapping_add(1 << 32);
        } else if diff > (1i128 << 31) {
            ext = ext.wrapping_sub(1 << 32);
        }
        if ext > self.ext_highest {
            self.ext_highest = ext;
        }
        ext
    }

    pub fn highest(&self) -> u64 {
        self.ext_highest
    }
}

/// One RTP packet plus its scheduling metadata, backed by a pooled buffer.
///
/// On the send path the buffer holds the serialized header, optional
/// extension and payload; on the receive path it holds the raw datagram
/// and the offsets are filled in by [`RtpPacket::parse_into`].
#[derive(Debug)]
pub struct RtpPacket {
    pub header: RtpHeader,
    /// Serialized packet bytes (header + extension + payload).
    pub buffer: Vec<u8>,
    /// Total valid length within `buffer`.
    pub len: usize,
    /// Byte length of the header extension block (0 if absent).
    pub ext_len: usize,

    pub input_time_us: u64,
    pub timeout_time_us: u64,
    pub ntp_time_us: u64,
    pub ext_rtp_ts: u64,
    pub ext_seq: u32,
    pub importance: u8,
    pub priority: u8,
}

impl RtpPacket {
    /// A blank descriptor with a preallocated buffer of `buf_size` bytes.
    pub fn with_capacity(buf_size: usize) -> Self {
        Self {
            header: RtpHeader::new(false, 0, 0, 0, false),
            buffer: vec![0u8; buf_size],
            len: 0,
            ext_len: 0,
            input_time_us: 0,
            timeout_time_us: 0,
            ntp_time_us: 0,
            ext_rtp_ts: 0,
            ext_seq: 0,
            importance: 0,
            priority: 0,
        }
    }

    /// Reset all descriptor fields, keeping the buffer allocation.
    pub fn reset(&mut self) {
        self.header = RtpHeader::new(false, 0, 0, 0, false);
        self.len = 0;
        self.ext_len = 0;
        self.input_time_us = 0;
        self.timeout_time_us = 0;
        self.ntp_time_us = 0;
        self.ext_rtp_ts = 0;
        self.ext_seq = 0;
        self.importance = 0;
        self.priority = 0;
    }

    /// Serialize `header` + optional `extension` + `payload` into the
    /// pooled buffer. The extension bytes must already carry their own
    /// `[profile][length]` framing (see [`ext`]).
    pub fn build(
        &mut self,
        mut header: RtpHeader,
        extension: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<()> {
        let ext_len = extension.map(|e| e.len()).unwrap_or(0);
        let total = RTP_HEADER_SIZE + ext_len + payload.len();
        if total > self.buffer.len() {
            return Err(Error::BadParameters(format!(
                "packet of {total} bytes exceeds buffer of {}",
                self.buffer.len()
            )));
        }
        header.extension = ext_len > 0;
        header.write(&mut self.buffer)?;
        if let Some(e) = extension {
            self.buffer[RTP_HEADER_SIZE..RTP_HEADER_SIZE + ext_len].copy_from_slice(e);
        }
        self.buffer[RTP_HEADER_SIZE + ext_len..total].copy_from_slice(payload);
        self.header = header;
        self.ext_len = ext_len;
        self.len = total;
        Ok(())
    }

    /// Parse a received datagram already present in the first `len` bytes
    /// of the buffer, filling the header and offsets.
    pub fn parse_into(&mut self, len: usize) -> Result<()> {
        self.header = RtpHeader::parse(&self.buffer[..len])?;
        let mut offset = RTP_HEADER_SIZE + self.header.csrc_count as usize * 4;
        if len < offset {
            return Err(Error::WireFormat("truncated CSRC list".into()));
        }
        self.ext_len = 0;
        if self.header.extension {
            let ext_total = ext::parsed_len(&self.buffer[offset..len])?;
            self.ext_len = ext_total;
            offset += ext_total;
        }
        if len < offset {
            return Err(Error::WireFormat("truncated header extension".into()));
        }
        self.len = len;
        Ok(())
    }

    /// Header-extension bytes including framing, if present.
    pub fn extension(&self) -> Option<&[u8]> {
        if self.ext_len > 0 {
            let start = RTP_HEADER_SIZE + self.header.csrc_count as usize * 4;
            Some(&self.buffer[start..start + self.ext_len])
        } else {
            None
        }
    }

    /// Payload bytes after header, CSRCs and extension.
    pub fn payload(&self) -> &[u8] {
        let start = RTP_HEADER_SIZE + self.header.csrc_count as usize * 4 + self.ext_len;
        &self.buffer[start.min(self.len)..self.len]
    }

    /// Full serialized packet.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = RtpHeader::new(true, 0x1234, 0xDEADBEEF, 0xCAFEBABE, false);
        let mut buf = [0u8; 12];
        hdr.write(&mut buf).unwrap();
        let parsed = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn test_header_too_short() {
        assert!(RtpHeader::parse(&[0x80, 0x60]).is_err());
    }

    #[test]
    fn test_header_wrong_version() {
        let mut buf = [0u8; 12];
        buf[0] = 0x00;
        assert!(RtpHeader::parse(&buf).is_err());
    }

    #[test]
    fn test_ext_seq_monotonic_across_wrap() {
        let mut t = ExtSeqTracker::new();
        let mut prev = t.extend(0xFFF0);
        for i in 1..0x40u32 {
            let s = 0xFFF0u16.wrapping_add(i as u16);
            let e = t.extend(s);
            assert_eq!(e, prev + 1, "wrap at i={i}");
            prev = e;
        }
        assert_eq!(t.highest(), 0xFFF0 + 0x3F);
    }

    #[test]
    fn test_ext_seq_reorder_before_wrap() {
        let mut t = ExtSeqTracker::new();
        t.extend(0xFFFE);
        t.extend(0xFFFF);
        let after_wrap = t.extend(0x0001);
        assert_eq!(after_wrap, 0x10001);
        // A straggler from before the wrap extends below the highest.
        let late = t.extend(0xFFFD);
        assert_eq!(late, 0xFFFD);
        assert_eq!(t.highest(), 0x10001);
    }

    #[test]
    fn test_ext_ts_wrap() {
        let mut t = ExtTsTracker::new();
        t.extend(0xFFFF_F000);
        let e = t.extend(0x0000_1000);
        assert_eq!(e, 0x1_0000_1000);
    }

    #[test]
    fn test_packet_build_parse() {
        let mut pkt = RtpPacket::with_capacity(1500);
        let hdr = RtpHeader::new(true, 7, 90_000, SENDER_SSRC, false);
        let payload = vec![0x65u8, 1, 2, 3, 4];
        pkt.build(hdr, None, &payload).unwrap();
        assert_eq!(pkt.len, RTP_HEADER_SIZE + 5);

        let mut rx = RtpPacket::with_capacity(1500);
        rx.buffer[..pkt.len].copy_from_slice(pkt.bytes());
        rx.parse_into(pkt.len).unwrap();
        assert_eq!(rx.header.seq, 7);
        assert!(rx.header.marker);
        assert_eq!(rx.payload(), &payload[..]);
        assert!(rx.extension().is_none());
    }

    #[test]
    fn test_packet_build_with_extension() {
        let mut ext_buf = Vec::new();
        ext::write(&mut ext_buf, &[0xAA, 0xBB, 0xCC, 0xDD]);

        let mut pkt = RtpPacket::with_capacity(1500);
        let hdr = RtpHeader::new(false, 1, 0, SENDER_SSRC, false);
        pkt.build(hdr, Some(&ext_buf), &[0x41, 0x00]).unwrap();

        let mut rx = RtpPacket::with_capacity(1500);
        rx.buffer[..pkt.len].copy_from_slice(pkt.bytes());
        rx.parse_into(pkt.len).unwrap();
        assert!(rx.header.extension);
        let ext_bytes = rx.extension().unwrap();
        assert_eq!(ext::payload(ext_bytes).unwrap(), &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(rx.payload(), &[0x41, 0x00]);
    }
}
