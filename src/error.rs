//! Error types shared across the streaming core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Caller contract violation; never retried.
    #[error("bad parameters: {0}")]
    BadParameters(String),

    /// A pool or FIFO could not be allocated; fatal for that component.
    #[error("allocation failed: {0}")]
    Alloc(String),

    /// Precondition not yet met (e.g. free before stop).
    #[error("component busy: {0}")]
    Busy(String),

    /// Upstream backpressure; recoverable by dropping.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// SPS/PPS have not been seen yet; retry after sync.
    #[error("waiting for SPS/PPS sync")]
    WaitingForSync,

    /// Component not started or mandatory callback absent.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed RTP/RTCP/H.264 data; the offending unit is dropped and
    /// the session continues.
    #[error("wire format error: {0}")]
    WireFormat(String),

    /// Bitstream feature the slice writer cannot produce (e.g. CABAC).
    #[error("unsupported bitstream: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::QueueFull("nalu fifo".into());
        assert_eq!(e.to_string(), "queue full: nalu fifo");
        let e = Error::WaitingForSync;
        assert!(e.to_string().contains("sync"));
    }
}
