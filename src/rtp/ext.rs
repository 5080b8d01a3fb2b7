//! RTP header-extension framing for vendor telemetry (RFC 3550 §5.3.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            0xBEEF             |        length in words        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  telemetry payload (length*4 bytes)           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The telemetry field contents themselves are opaque to the core; they are
//! carried verbatim into the access unit's metadata slot.

use crate::error::{Error, Result};

/// Extension profile identifier on the wire.
pub const PROFILE_ID: u16 = 0xBEEF;

/// Append a framed extension block to `out`. The payload is padded with
/// zeros to a 32-bit boundary.
pub fn write(out: &mut Vec<u8>, payload: &[u8]) {
    let words = (payload.len() + 3) / 4;
    out.extend_from_slice(&PROFILE_ID.to_be_bytes());
    out.extend_from_slice(&(words as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(out.len() + words * 4 - payload.len(), 0);
}

/// Total byte length (framing included) of the extension block at the
/// start of `data`.
pub fn parsed_len(data: &[u8]) -> Result<usize> {
    if data.len() < 4 {
        return Err(Error::WireFormat("truncated extension header".into()));
    }
    let words = u16::from_be_bytes([data[2], data[3]]) as usize;
    let total = 4 + words * 4;
    if data.len() < total {
        return Err(Error::WireFormat(format!(
            "extension claims {total} bytes, only {} available",
            data.len()
        )));
    }
    Ok(total)
}

/// Payload bytes of a framed extension block (profile is not enforced so
/// foreign extensions still parse; the filter decides what to keep).
pub fn payload(data: &[u8]) -> Result<&[u8]> {
    let total = parsed_len(data)?;
    Ok(&data[4..total])
}

/// Profile identifier of a framed extension block.
pub fn profile(data: &[u8]) -> Result<u16> {
    if data.len() < 2 {
        return Err(Error::WireFormat("truncated extension header".into()));
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_parse_roundtrip() {
        let mut buf = Vec::new();
        write(&mut buf, &[1, 2, 3, 4, 5]);
        assert_eq!(buf.len(), 4 + 8); // padded to 2 words
        assert_eq!(profile(&buf).unwrap(), PROFILE_ID);
        assert_eq!(parsed_len(&buf).unwrap(), 12);
        assert_eq!(payload(&buf).unwrap(), &[1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = Vec::new();
        write(&mut buf, &[]);
        assert_eq!(buf.len(), 4);
        assert_eq!(payload(&buf).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_truncated() {
        assert!(parsed_len(&[0xBE]).is_err());
        // Claims 4 words but carries none.
        assert!(parsed_len(&[0xBE, 0xEF, 0x00, 0x04]).is_err());
    }
}
