//! SEI message handling: the vendor streaming-info message and generic
//! user-data capture.
//!
//! The streaming-info SEI is a `user_data_unregistered` message (payload
//! type 5) identified by a fixed UUID. It describes the slice layout of
//! the access unit it travels with, which is what makes missing-slice
//! concealment possible:
//!
//! ```text
//! [16-byte UUID][index_in_gop u16][slice_count u16][slice_mb_count u16 * slice_count]
//! ```
//!
//! All integers big-endian. Other user-data SEIs are surfaced verbatim so
//! the host can read encoder telemetry the core does not interpret.

use super::bitstream::{escape_rbsp, unescape_rbsp};
use super::NaluType;
use crate::error::{Error, Result};

/// UUID identifying the streaming-info user-data SEI.
pub const STREAMING_INFO_UUID: [u8; 16] = [
    0x73, 0x9A, 0x2D, 0xE1, 0x5B, 0x04, 0x4C, 0x29, 0x92, 0x5F, 0x8C, 0x60, 0x17, 0xBD, 0x33,
    0x8A,
];

/// SEI payload type for user_data_unregistered.
pub const PAYLOAD_TYPE_USER_DATA: u32 = 5;

/// Maximum slice count carried in one streaming-info message.
pub const MAX_SLICE_COUNT: usize = 128;

/// Slice layout of one access unit, as announced by the encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingInfo {
    /// Position of this AU within its GOP; 0 marks the start of a
    /// periodic intra refresh.
    pub index_in_gop: u16,
    pub slice_mb_count: Vec<u16>,
}

impl StreamingInfo {
    pub fn slice_count(&self) -> usize {
        self.slice_mb_count.len()
    }
}

/// One SEI message extracted from a NAL unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeiMessage {
    Streaming(StreamingInfo),
    /// Other user-data payload: (uuid, body).
    UserData([u8; 16], Vec<u8>),
    /// Non-user-data message: (payload_type, body).
    Other(u32, Vec<u8>),
}

/// Parse every message of an SEI NAL unit (header byte included).
pub fn parse_sei(nalu: &[u8]) -> Result<Vec<SeiMessage>> {
    if nalu.is_empty() || NaluType::from_header(nalu[0]) != NaluType::Sei {
        return Err(Error::WireFormat("not an SEI NAL unit".into()));
    }
    let rbsp = unescape_rbsp(&nalu[1..]);
    let mut messages = Vec::new();
    let mut pos = 0usize;

    // Messages are byte-aligned; the RBSP ends with the trailing 0x80.
    while pos < rbsp.len() && rbsp[pos] != 0x80 {
        let mut payload_type = 0u32;
        while pos < rbsp.len() && rbsp[pos] == 0xFF {
            payload_type += 255;
            pos += 1;
        }
        if pos >= rbsp.len() {
            return Err(Error::WireFormat("truncated SEI payload type".into()));
        }
        payload_type += rbsp[pos] as u32;
        pos += 1;

        let mut payload_size = 0usize;
        while pos < rbsp.len() && rbsp[pos] == 0xFF {
            payload_size += 255;
            pos += 1;
        }
        if pos >= rbsp.len() {
            return Err(Error::WireFormat("truncated SEI payload size".into()));
        }
        payload_size += rbsp[pos] as usize;
        pos += 1;

        if pos + payload_size > rbsp.len() {
            return Err(Error::WireFormat("SEI payload exceeds NAL unit".into()));
        }
        let body = &rbsp[pos..pos + payload_size];
        pos += payload_size;

        if payload_type == PAYLOAD_TYPE_USER_DATA && body.len() >= 16 {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&body[..16]);
            if uuid == STREAMING_INFO_UUID {
                messages.push(SeiMessage::Streaming(parse_streaming_body(&body[16..])?));
            } else {
                messages.push(SeiMessage::UserData(uuid, body[16..].to_vec()));
            }
        } else {
            messages.push(SeiMessage::Other(payload_type, body.to_vec()));
        }
    }
    Ok(messages)
}

fn parse_streaming_body(body: &[u8]) -> Result<StreamingInfo> {
    if body.len() < 4 {
        return Err(Error::WireFormat("streaming info SEI too short".into()));
    }
    let index_in_gop = u16::from_be_bytes([body[0], body[1]]);
    let slice_count = u16::from_be_bytes([body[2], body[3]]) as usize;
    if slice_count > MAX_SLICE_COUNT {
        return Err(Error::WireFormat(format!(
            "streaming info slice count {slice_count} exceeds {MAX_SLICE_COUNT}"
        )));
    }
    if body.len() < 4 + slice_count * 2 {
        return Err(Error::WireFormat("streaming info slice table truncated".into()));
    }
    let slice_mb_count = (0..slice_count)
        .map(|i| u16::from_be_bytes([body[4 + i * 2], body[5 + i * 2]]))
        .collect();
    Ok(StreamingInfo {
        index_in_gop,
        slice_mb_count,
    })
}

fn write_payload_header(out: &mut Vec<u8>, payload_type: u32, mut size: usize) {
    let mut ty = payload_type;
    while ty >= 255 {
        out.push(0xFF);
        ty -= 255;
    }
    out.push(ty as u8);
    while size >= 255 {
        out.push(0xFF);
        size -= 255;
    }
    out.push(size as u8);
}

/// Build a complete SEI NAL unit carrying one streaming-info message.
pub fn write_streaming_info(info: &StreamingInfo) -> Vec<u8> {
    let mut body = Vec::with_capacity(20 + info.slice_mb_count.len() * 2);
    body.extend_from_slice(&STREAMING_INFO_UUID);
    body.extend_from_slice(&info.index_in_gop.to_be_bytes());
    body.extend_from_slice(&(info.slice_mb_count.len() as u16).to_be_bytes());
    for &count in &info.slice_mb_count {
        body.extend_from_slice(&count.to_be_bytes());
    }

    let mut rbsp = Vec::with_capacity(body.len() + 4);
    write_payload_header(&mut rbsp, PAYLOAD_TYPE_USER_DATA, body.len());
    rbsp.extend_from_slice(&body);
    rbsp.push(0x80); // rbsp trailing bits

    let mut nalu = vec![0x06]; // F=0, NRI=0, type 6
    nalu.extend_from_slice(&escape_rbsp(&rbsp));
    nalu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_info_roundtrip() {
        let info = StreamingInfo {
            index_in_gop: 7,
            slice_mb_count: vec![50, 50, 50],
        };
        let nalu = write_streaming_info(&info);
        assert_eq!(NaluType::from_header(nalu[0]), NaluType::Sei);
        let messages = parse_sei(&nalu).unwrap();
        assert_eq!(messages, vec![SeiMessage::Streaming(info)]);
    }

    #[test]
    fn test_foreign_user_data_preserved() {
        // Same framing, different UUID.
        let mut body = vec![0xAB; 16];
        body.extend_from_slice(&[1, 2, 3]);
        let mut rbsp = Vec::new();
        write_payload_header(&mut rbsp, PAYLOAD_TYPE_USER_DATA, body.len());
        rbsp.extend_from_slice(&body);
        rbsp.push(0x80);
        let mut nalu = vec![0x06];
        nalu.extend_from_slice(&escape_rbsp(&rbsp));

        let messages = parse_sei(&nalu).unwrap();
        match &messages[0] {
            SeiMessage::UserData(uuid, data) => {
                assert_eq!(uuid, &[0xAB; 16]);
                assert_eq!(data, &[1, 2, 3]);
            }
            other => panic!("expected user data, got {other:?}"),
        }
    }

    #[test]
    fn test_non_user_data_message() {
        // Recovery point (type 6) with a 1-byte body.
        let rbsp = vec![0x06, 0x01, 0x40, 0x80];
        let mut nalu = vec![0x06];
        nalu.extend_from_slice(&rbsp);
        let messages = parse_sei(&nalu).unwrap();
        assert_eq!(messages, vec![SeiMessage::Other(6, vec![0x40])]);
    }

    #[test]
    fn test_truncated_sei_rejected() {
        let nalu = vec![0x06, 0x05, 0x20]; // claims 32 bytes, has none
        assert!(parse_sei(&nalu).is_err());
    }
}
