//! uavlink — low-latency H.264 video streaming core for drone-to-ground
//! links.
//!
//! The crate has two symmetric halves anchored on shared primitives:
//!
//! - [`sender::Sender`] ingests H.264 NAL units, payloads them per
//!   RFC 6184 (single NAL / STAP-A / FU-A) with per-NALU importance and
//!   latency budgets, and ships them over UDP with congestion-aware
//!   dropping and RTCP sender reports.
//! - [`stream::StreamReceiver`] reassembles access units from the
//!   unreliable link (reordering, partial frames, error concealment via
//!   gray IDR frames and skipped-P slices) and fans them out to a
//!   decoder-facing consumer, optional recorder sinks and resenders.

pub mod config;
pub mod error;
pub mod fifo;
pub mod h264;
pub mod net;
pub mod receiver;
pub mod rtcp;
pub mod rtp;
pub mod sender;
pub mod stats;
pub mod stream;
pub mod time;

pub use config::{ReceiverConfig, SenderConfig};
pub use error::{Error, Result};
pub use fifo::au::AccessUnit;
pub use h264::filter::{AuConsumer, AuReadyStatus, FilterConfig};
pub use h264::payloader::{DeliveryStatus, SenderEvents};
pub use receiver::{Receiver, ReceiverStats};
pub use sender::{NaluSubmission, Sender};
pub use stream::{H264FileSink, RecorderSink, StreamReceiver, StreamReceiverConfig};
