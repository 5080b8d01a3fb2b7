//! NAL-unit descriptors and the bounded submission FIFO on the send path.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::h264::{NaluType, SliceType};

/// One NAL unit queued for transmission, with its scheduling attributes.
#[derive(Debug, Clone)]
pub struct NaluDesc {
    /// NAL bytes (header byte included, no start code).
    pub payload: Bytes,
    /// Optional telemetry carried as the RTP header extension of the
    /// first packet of this NALU; must include the extension framing.
    pub metadata: Option<Bytes>,

    /// Acquisition time on the sender clock (microseconds).
    pub ntp_time_us: u64,
    /// Time this NALU entered the FIFO.
    pub input_time_us: u64,
    /// Drop deadline; 0 disables the timeout.
    pub timeout_time_us: u64,

    pub nalu_type: NaluType,
    pub slice_type: SliceType,
    /// 0 = most important; drop order under congestion.
    pub importance: u8,
    pub priority: u8,
    pub is_last_in_au: bool,
    /// Extra sequence-number steps to insert before this NALU so the
    /// receiver observes a deliberate gap.
    pub seq_gap_before: u16,

    /// Opaque handles echoed back through the status callbacks.
    pub au_token: u64,
    pub nalu_token: u64,
}

impl NaluDesc {
    pub fn new(payload: Bytes, ntp_time_us: u64) -> Self {
        let nalu_type = payload
            .first()
            .map(|b| NaluType::from_header(*b))
            .unwrap_or(NaluType::Other(0));
        Self {
            payload,
            metadata: None,
            ntp_time_us,
            input_time_us: 0,
            timeout_time_us: 0,
            nalu_type,
            slice_type: SliceType::Unknown,
            importance: 0,
            priority: 0,
            is_last_in_au: false,
            seq_gap_before: 0,
            au_token: 0,
            nalu_token: 0,
        }
    }
}

/// Bounded FIFO of NAL units awaiting payloading.
#[derive(Debug)]
pub struct NaluFifo {
    queue: VecDeque<NaluDesc>,
    capacity: usize,
}

impl NaluFifo {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::BadParameters("NALU FIFO needs nonzero capacity".into()));
        }
        Ok(Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, nalu: NaluDesc) -> Result<()> {
        if self.queue.len() >= self.capacity {
            return Err(Error::QueueFull("NALU FIFO".into()));
        }
        self.queue.push_back(nalu);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<NaluDesc> {
        self.queue.pop_front()
    }

    /// Drain everything (stop path).
    pub fn drain(&mut self) -> Vec<NaluDesc> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let mut fifo = NaluFifo::new(4).unwrap();
        for i in 0..3u64 {
            let mut n = NaluDesc::new(Bytes::from(vec![0x41, i as u8]), 1000 + i);
            n.nalu_token = i;
            fifo.push(n).unwrap();
        }
        assert_eq!(fifo.pop().unwrap().nalu_token, 0);
        assert_eq!(fifo.pop().unwrap().nalu_token, 1);
        assert_eq!(fifo.pop().unwrap().nalu_token, 2);
        assert!(fifo.pop().is_none());
    }

    #[test]
    fn test_queue_full() {
        let mut fifo = NaluFifo::new(1).unwrap();
        fifo.push(NaluDesc::new(Bytes::from_static(&[0x65]), 0)).unwrap();
        let err = fifo.push(NaluDesc::new(Bytes::from_static(&[0x65]), 0));
        assert!(matches!(err, Err(Error::QueueFull(_))));
    }

    #[test]
    fn test_nalu_type_derived_from_payload() {
        let n = NaluDesc::new(Bytes::from_static(&[0x67, 0x42]), 0);
        assert_eq!(n.nalu_type, NaluType::Sps);
    }
}
