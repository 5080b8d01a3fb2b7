//! Stream receiver glue: receiver core + filter worker + fan-out to the
//! application consumer, recorder sinks and resenders.
//!
//! Every completed access unit flows once through the filter, then is
//! duplicated by descriptor into each registered queue; the payload
//! buffer is shared and refcounted. A full downstream queue only loses
//! its own copy.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::config::{ReceiverConfig, SenderConfig};
use crate::error::Result;
use crate::fifo::au::{AccessUnit, AuBufferPool, AuFanout, AuPoolConfig};
use crate::h264::filter::{AuConsumer, FilterConfig, H264Filter};
use crate::h264::payloader::NullEvents;
use crate::h264::{NaluType, START_CODE};
use crate::receiver::{Receiver, ReceiverStats, VideoStatsSlot};
use crate::sender::{NaluSubmission, Sender};
use crate::stats::{accumulate_timing, StatsFileWriter, StatsWindow};

/// Host-pluggable sink for the raw recorded stream (e.g. an MP4 muxer
/// front-end). Receives complete access units with vendor metadata.
pub trait RecorderSink: Send {
    fn record_au(&mut self, au: &AccessUnit) -> Result<()>;
}

/// Recorder sink writing the raw Annex-B elementary stream to a file.
pub struct H264FileSink {
    out: std::io::BufWriter<std::fs::File>,
    aus_written: u64,
}

impl H264FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            out: std::io::BufWriter::new(std::fs::File::create(path)?),
            aus_written: 0,
        })
    }
}

impl RecorderSink for H264FileSink {
    fn record_au(&mut self, au: &AccessUnit) -> Result<()> {
        use std::io::Write as _;
        self.out.write_all(&au.buffer.data)?;
        self.aus_written += 1;
        if self.aus_written % 300 == 0 {
            self.out.flush()?;
        }
        Ok(())
    }
}

/// Configuration of the whole receive-side stack.
#[derive(Debug, Clone, Default)]
pub struct StreamReceiverConfig {
    pub receiver: ReceiverConfig,
    pub filter: FilterConfig,
    /// Stats sidecar file; `None` disables it.
    pub stats_path: Option<PathBuf>,
}

/// Receive-side stack: receiver core, filter worker and fan-out.
pub struct StreamReceiver {
    receiver: Receiver,
    fanout: Arc<Mutex<AuFanout>>,
    filter_stop: Arc<Notify>,
    filter_handle: Option<tokio::task::JoinHandle<()>>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    stopped: bool,
}

impl StreamReceiver {
    /// Start the receiver core and the filter worker.
    pub async fn start(
        cfg: StreamReceiverConfig,
        local_stream: SocketAddr,
        local_control: SocketAddr,
        remote_control: SocketAddr,
        consumer: Box<dyn AuConsumer>,
    ) -> Result<Self> {
        let filter = H264Filter::new(cfg.filter, consumer)?;
        let mut receiver =
            Receiver::start(cfg.receiver, local_stream, local_control, remote_control).await?;
        let assemblies = receiver
            .take_assemblies()
            .expect("fresh receiver owns its assembly channel");
        let stats_writer = match &cfg.stats_path {
            Some(path) => Some(StatsFileWriter::create(path)?),
            None => None,
        };

        let fanout = Arc::new(Mutex::new(AuFanout::new()));
        let filter_stop = Arc::new(Notify::new());
        let filter_handle = {
            let fanout = fanout.clone();
            let stop = filter_stop.clone();
            let slot = receiver.video_stats_slot();
            Some(tokio::spawn(filter_worker(
                assemblies,
                filter,
                fanout,
                slot,
                stats_writer,
                stop,
            )))
        };

        Ok(Self {
            receiver,
            fanout,
            filter_stop,
            filter_handle,
            worker_handles: Vec::new(),
            stopped: false,
        })
    }

    pub fn local_stream_addr(&self) -> Result<SocketAddr> {
        self.receiver.local_stream_addr()
    }

    pub fn local_control_addr(&self) -> Result<SocketAddr> {
        self.receiver.local_control_addr()
    }

    pub async fn connect_control(&self, remote: SocketAddr) -> Result<()> {
        self.receiver.connect_control(remote).await
    }

    pub async fn stats(&self) -> ReceiverStats {
        self.receiver.stats().await
    }

    /// Register a raw AU tap (application-side secondary consumer).
    pub async fn register_queue(&self, name: &str, depth: usize) -> mpsc::Receiver<AccessUnit> {
        self.fanout.lock().await.register(name, depth)
    }

    /// Attach a recorder: every access unit (vendor metadata included)
    /// is duplicated into its queue and handed to the sink in order.
    pub async fn start_recorder(&mut self, mut sink: Box<dyn RecorderSink>) {
        let mut rx = self.fanout.lock().await.register("recorder", 64);
        self.worker_handles.push(tokio::spawn(async move {
            while let Some(au) = rx.recv().await {
                if let Err(e) = sink.record_au(&au) {
                    tracing::warn!("recorder sink failed: {e}");
                }
            }
            tracing::info!("recorder worker stopped");
        }));
    }

    /// Attach a resender forwarding the received stream to another
    /// destination with its own latency budgets.
    pub async fn add_resender(
        &mut self,
        cfg: SenderConfig,
        local_stream: SocketAddr,
        local_control: SocketAddr,
        remote_stream: SocketAddr,
        remote_control: SocketAddr,
    ) -> Result<()> {
        let sender = Sender::start(
            cfg,
            local_stream,
            local_control,
            remote_stream,
            remote_control,
            Box::new(NullEvents),
        )
        .await?;
        let mut rx = self.fanout.lock().await.register("resender", 64);
        self.worker_handles.push(tokio::spawn(async move {
            let mut sender = sender;
            while let Some(au) = rx.recv().await {
                if let Err(e) = resend_au(&sender, &au).await {
                    tracing::debug!("resend failed: {e}");
                }
            }
            let _ = sender.stop().await;
            tracing::info!("resender worker stopped");
        }));
        Ok(())
    }

    /// Stop the whole stack: receiver first, then the filter worker
    /// drains, then the fan-out workers run dry.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.receiver.stop().await?;
        self.filter_stop.notify_waiters();
        if let Some(h) = self.filter_handle.take() {
            let _ = h.await;
        }
        // Dropping our fan-out reference closes the worker queues.
        self.fanout = Arc::new(Mutex::new(AuFanout::new()));
        for h in self.worker_handles.drain(..) {
            let _ = h.await;
        }
        self.stopped = true;
        Ok(())
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if let Some(h) = self.filter_handle.take() {
            h.abort();
        }
        for h in self.worker_handles.drain(..) {
            h.abort();
        }
    }
}

/// Re-payload one access unit onto a forwarding sender.
async fn resend_au(sender: &Sender, au: &AccessUnit) -> Result<()> {
    let mut nalus = Vec::with_capacity(au.nalus.len());
    for info in &au.nalus {
        let bytes = au.nalu_bytes(info);
        let body = if bytes.len() >= 4 && bytes[..4] == START_CODE {
            &bytes[4..]
        } else {
            bytes
        };
        if body.is_empty() {
            continue;
        }
        let importance = match info.nalu_type {
            NaluType::Sps | NaluType::Pps | NaluType::SliceIdr => 0,
            NaluType::Sei => 2,
            _ => 1,
        };
        let mut sub = NaluSubmission::new(Bytes::copy_from_slice(body));
        sub.importance = importance;
        nalus.push(sub);
    }
    let metadata = if au.buffer.metadata.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(&au.buffer.metadata))
    };
    sender
        .submit_au(nalus, metadata, au.ntp_time_us, au.ext_rtp_ts)
        .await
}

async fn filter_worker(
    mut assemblies: mpsc::Receiver<crate::fifo::au::AuAssembly>,
    mut filter: H264Filter,
    fanout: Arc<Mutex<AuFanout>>,
    stats_slot: VideoStatsSlot,
    mut stats_writer: Option<StatsFileWriter>,
    stop: Arc<Notify>,
) {
    // Synthesized access units (gray IDR) draw from a dedicated pool so
    // the receive pool's occupancy stays a pure function of the wire.
    let mut synth_pool = AuBufferPool::new(AuPoolConfig {
        slots: 4,
        data_capacity: 256 * 1024,
        metadata_capacity: 64,
        sidecar_capacity: 16 * 1024,
    })
    .expect("static pool config");
    let mut sidecar_window = StatsWindow::new(1_000_000);
    let mut prev_frame_ntp_us = 0u64;

    tracing::info!("filter worker started");
    loop {
        let assembly = tokio::select! {
            _ = stop.notified() => break,
            asm = assemblies.recv() => match asm {
                Some(asm) => asm,
                None => break,
            },
        };
        process_one(
            assembly,
            &mut filter,
            &mut synth_pool,
            &fanout,
            &stats_slot,
            &mut stats_writer,
            &mut sidecar_window,
            &mut prev_frame_ntp_us,
        )
        .await;
    }
    // Drain whatever arrived before the stop signal.
    while let Ok(assembly) = assemblies.try_recv() {
        process_one(
            assembly,
            &mut filter,
            &mut synth_pool,
            &fanout,
            &stats_slot,
            &mut stats_writer,
            &mut sidecar_window,
            &mut prev_frame_ntp_us,
        )
        .await;
    }
    tracing::info!("filter worker stopped");
}

#[allow(clippy::too_many_arguments)]
async fn process_one(
    assembly: crate::fifo::au::AuAssembly,
    filter: &mut H264Filter,
    synth_pool: &mut AuBufferPool,
    fanout: &Arc<Mutex<AuFanout>>,
    stats_slot: &VideoStatsSlot,
    stats_writer: &mut Option<StatsFileWriter>,
    sidecar_window: &mut StatsWindow,
    prev_frame_ntp_us: &mut u64,
) {
    let local_now = assembly.ntp_time_local_us;
    let frame_interval_us = filter
        .framerate
        .filter(|f| *f > 0.0)
        .map(|f| (1_000_000.0 / f) as u64)
        .unwrap_or(0);

    match filter.process_assembly(assembly, synth_pool) {
        Ok(outputs) => {
            let mut fanout = fanout.lock().await;
            for au in outputs {
                // Meaningful only once the SR regression maps sender time
                // onto our clock; saturates to zero before that.
                let delivery_latency_us = au.ntp_time_local_us.saturating_sub(au.ntp_time_us);
                accumulate_timing(
                    &mut filter.stats,
                    frame_interval_us,
                    *prev_frame_ntp_us,
                    au.ntp_time_us,
                    delivery_latency_us,
                );
                *prev_frame_ntp_us = au.ntp_time_us;
                fanout.dispatch(&au);
            }
        }
        Err(e) => tracing::warn!("filter failed on access unit: {e}"),
    }

    *stats_slot.lock().unwrap() = Some(filter.stats.clone());
    if sidecar_window.due(local_now) {
        if let Some(writer) = stats_writer {
            if let Err(e) = writer.append(&filter.stats) {
                tracing::warn!("stats sidecar write failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::conceal::{write_pps, write_sps, SpsConfig};
    use crate::h264::filter::AuReadyStatus;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct CollectingConsumer {
        delivered: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl AuConsumer for CollectingConsumer {
        fn get_au_buffer(&mut self, size_hint: usize) -> Option<Vec<u8>> {
            Some(vec![0u8; size_hint])
        }
        fn au_ready(&mut self, buffer: Vec<u8>, len: usize, _au: &AccessUnit) -> AuReadyStatus {
            self.delivered.lock().unwrap().push(buffer[..len].to_vec());
            AuReadyStatus::Ok
        }
    }

    /// Slice NAL with a parseable header (I, first_mb 0).
    fn idr_slice() -> Vec<u8> {
        use crate::h264::bitstream::BitWriter;
        let mut w = BitWriter::new();
        w.write_ue(0);
        w.write_ue(7);
        w.write_ue(0);
        w.write_bits(0, 4);
        w.write_ue(0);
        w.write_trailing_bits();
        let mut nalu = vec![0x65];
        nalu.extend_from_slice(&w.into_escaped());
        nalu.extend(std::iter::repeat(0xA5).take(400));
        nalu
    }

    #[tokio::test]
    async fn test_end_to_end_with_filter_and_taps() {
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let consumer = CollectingConsumer {
            delivered: delivered.clone(),
        };

        let mut stream = StreamReceiver::start(
            StreamReceiverConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Box::new(consumer),
        )
        .await
        .unwrap();
        let mut tap = stream.register_queue("tap", 16).await;

        let dir = std::env::temp_dir().join(format!("uavlink-rec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let record_path = dir.join("capture.h264");
        stream
            .start_recorder(Box::new(H264FileSink::create(&record_path).unwrap()))
            .await;

        let mut sender = Sender::start(
            SenderConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            stream.local_stream_addr().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Box::new(NullEvents),
        )
        .await
        .unwrap();

        // One sync AU (SPS+PPS+IDR), then two plain ones.
        let sps = write_sps(&SpsConfig {
            mb_width: 11,
            mb_height: 9,
            framerate_num: 30,
            framerate_den: 1,
        });
        let pps = write_pps();
        let idr = idr_slice();
        let clock = sender.clock();
        let base = clock.now_us();
        sender
            .submit_au(
                vec![
                    NaluSubmission::new(Bytes::from(sps.clone())),
                    NaluSubmission::new(Bytes::from(pps.clone())),
                    NaluSubmission::new(Bytes::from(idr.clone())),
                ],
                None,
                base,
                1,
            )
            .await
            .unwrap();
        for i in 1..3u64 {
            sender
                .submit_au(
                    vec![NaluSubmission::new(Bytes::from(idr.clone()))],
                    None,
                    base + i * 33_333,
                    1 + i,
                )
                .await
                .unwrap();
        }

        // All three AUs surface on the tap.
        for _ in 0..3 {
            let au = tokio::time::timeout(Duration::from_secs(3), tap.recv())
                .await
                .expect("timed out waiting for AU on tap")
                .expect("tap closed");
            assert!(au.is_complete);
        }

        // The consumer received the filtered copies.
        let wait_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if delivered.lock().unwrap().len() >= 3 {
                break;
            }
            if tokio::time::Instant::now() > wait_deadline {
                panic!("consumer did not receive 3 AUs");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let first = delivered.lock().unwrap()[0].clone();
        // SPS + PPS + IDR, start-code framed.
        assert_eq!(first.len(), 3 * 4 + sps.len() + pps.len() + idr.len());
        assert_eq!(&first[..4], &START_CODE);

        sender.stop().await.unwrap();
        stream.stop().await.unwrap();

        // Recorder wrote the raw stream.
        let recorded = std::fs::read(&record_path).unwrap();
        assert!(recorded.len() >= first.len());
        assert_eq!(&recorded[..4], &START_CODE);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_resender_forwards_stream() {
        // Final hop: a plain receiver collecting what the resender sends.
        let mut hop_receiver = Receiver::start(
            ReceiverConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        )
        .await
        .unwrap();
        let hop_stream_addr = hop_receiver.local_stream_addr().unwrap();
        let mut hop_assemblies = hop_receiver.take_assemblies().unwrap();

        let consumer = CollectingConsumer {
            delivered: Arc::new(StdMutex::new(Vec::new())),
        };
        let mut stream = StreamReceiver::start(
            StreamReceiverConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Box::new(consumer),
        )
        .await
        .unwrap();
        stream
            .add_resender(
                SenderConfig::default(),
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:0".parse().unwrap(),
                hop_stream_addr,
                "127.0.0.1:9".parse().unwrap(),
            )
            .await
            .unwrap();

        let mut sender = Sender::start(
            SenderConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            stream.local_stream_addr().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Box::new(NullEvents),
        )
        .await
        .unwrap();

        let sps = write_sps(&SpsConfig {
            mb_width: 11,
            mb_height: 9,
            framerate_num: 30,
            framerate_den: 1,
        });
        let pps = write_pps();
        let idr = idr_slice();
        sender
            .submit_au(
                vec![
                    NaluSubmission::new(Bytes::from(sps)),
                    NaluSubmission::new(Bytes::from(pps)),
                    NaluSubmission::new(Bytes::from(idr.clone())),
                ],
                None,
                sender.clock().now_us(),
                1,
            )
            .await
            .unwrap();

        // The AU crosses both hops.
        let au = tokio::time::timeout(Duration::from_secs(3), hop_assemblies.recv())
            .await
            .expect("timed out waiting for resent AU")
            .expect("hop channel closed");
        assert_eq!(au.nalus.len(), 3);
        let last = au.nalu_bytes(&au.nalus[2]);
        assert_eq!(&last[4..], &idr[..]);

        sender.stop().await.unwrap();
        stream.stop().await.unwrap();
        hop_receiver.stop().await.unwrap();
    }
}
