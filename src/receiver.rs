//! Receiver core: batch datagram intake, ordered queueing, depayloading,
//! receiver reports and peer clock recovery.
//!
//! The receive loop drains the socket until it would block (filling
//! pooled packet buffers), inserts by extended sequence number, then runs
//! the depayloader over the in-order prefix. Completed access-unit
//! assemblies flow to the stream receiver through a bounded channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::config::ReceiverConfig;
use crate::error::Result;
use crate::fifo::au::{AuAssembly, AuBufferPool, AuPoolConfig};
use crate::fifo::packet::{InsertResult, PacketFifo};
use crate::h264::depayloader::Depayloader;
use crate::net::bind_udp;
use crate::rtcp;
use crate::rtcp::state::ReceiverRtcpContext;
use crate::rtp::{ExtSeqTracker, ExtTsTracker, CLOCK_RATE, PT_H264, RECEIVER_SSRC};
use crate::stats::StatsWindow;
use crate::time::MonotonicClock;

/// Reception counters surfaced to the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    pub packets_received: u32,
    pub packets_lost: u32,
    pub out_of_order: u64,
    pub duplicates: u64,
    /// Packets that arrived after the depayloader had moved past them.
    pub untimely: u64,
    pub access_units: u64,
    pub access_units_dropped: u64,
    pub jitter_rtp_units: u32,
    pub clock_delta_avg_us: i64,
}

struct ReceiverState {
    packet_fifo: PacketFifo,
    pool: AuBufferPool,
    depayloader: Depayloader,
    rtcp: ReceiverRtcpContext,
    seq_tracker: ExtSeqTracker,
    ts_tracker: ExtTsTracker,
    out_of_order: u64,
    duplicates: u64,
    untimely: u64,
    access_units: u64,
    access_units_dropped: u64,
    video_stats_window: StatsWindow,
}

/// Shared slot the filter worker refreshes with the latest statistics;
/// the report path takes from it on the upload cadence.
pub type VideoStatsSlot = Arc<std::sync::Mutex<Option<rtcp::VideoStats>>>;

struct ReceiverShared {
    clock: MonotonicClock,
    state: Mutex<ReceiverState>,
    stream_socket: tokio::net::UdpSocket,
    control_socket: tokio::net::UdpSocket,
    should_stop: AtomicBool,
    stop: Notify,
    assemblies_tx: mpsc::Sender<AuAssembly>,
    reorder_timeout_us: u64,
    generate_receiver_reports: bool,
    video_stats_slot: VideoStatsSlot,
}

/// A running stream receiver.
pub struct Receiver {
    shared: Arc<ReceiverShared>,
    recv_handle: Option<tokio::task::JoinHandle<()>>,
    control_handle: Option<tokio::task::JoinHandle<()>>,
    assemblies_rx: Option<mpsc::Receiver<AuAssembly>>,
    stopped: bool,
}

impl Receiver {
    /// Bind the stream and control sockets and start the receive tasks.
    pub async fn start(
        cfg: ReceiverConfig,
        local_stream: SocketAddr,
        local_control: SocketAddr,
        remote_control: SocketAddr,
    ) -> Result<Self> {
        cfg.validate()?;

        let recv_buffer = cfg.socket_buffer_size();
        let stream_socket = bind_udp(local_stream, None, None, Some(recv_buffer))?;
        let control_socket = bind_udp(local_control, Some(remote_control), None, None)?;
        tracing::info!(
            "receiver bound on {} (stream) / {} (control), SO_RCVBUF {}",
            stream_socket.local_addr()?,
            control_socket.local_addr()?,
            recv_buffer
        );

        let cname = if cfg.cname.is_empty() {
            "gcs@uavlink".to_string()
        } else {
            cfg.cname.clone()
        };
        // Sized so one slot can hold a worst-case intra frame.
        let pool = AuBufferPool::new(AuPoolConfig {
            slots: cfg.au_pool_slots,
            data_capacity: 512 * 1024,
            metadata_capacity: 1024,
            sidecar_capacity: 16 * 1024,
        })?;
        let state = ReceiverState {
            packet_fifo: PacketFifo::new(cfg.packet_fifo_size, cfg.max_packet_size)?,
            pool,
            depayloader: Depayloader::new(CLOCK_RATE),
            rtcp: ReceiverRtcpContext::new(RECEIVER_SSRC, CLOCK_RATE, cfg.rtcp_byte_rate(), &cname),
            seq_tracker: ExtSeqTracker::new(),
            ts_tracker: ExtTsTracker::new(),
            out_of_order: 0,
            duplicates: 0,
            untimely: 0,
            access_units: 0,
            access_units_dropped: 0,
            video_stats_window: StatsWindow::new(cfg.video_stats_send_interval_ms * 1000),
        };

        let (assemblies_tx, assemblies_rx) = mpsc::channel(32);
        let shared = Arc::new(ReceiverShared {
            clock: MonotonicClock::new(),
            state: Mutex::new(state),
            stream_socket,
            control_socket,
            should_stop: AtomicBool::new(false),
            stop: Notify::new(),
            assemblies_tx,
            reorder_timeout_us: cfg.reorder_timeout_us(),
            generate_receiver_reports: cfg.generate_receiver_reports,
            video_stats_slot: VideoStatsSlot::default(),
        });

        let recv_handle = {
            let shared = shared.clone();
            Some(tokio::spawn(recv_loop(shared)))
        };
        let control_handle = {
            let shared = shared.clone();
            Some(tokio::spawn(control_loop(shared)))
        };

        Ok(Self {
            shared,
            recv_handle,
            control_handle,
            assemblies_rx: Some(assemblies_rx),
            stopped: false,
        })
    }

    /// Take the access-unit assembly channel (filter input). Single call.
    pub fn take_assemblies(&mut self) -> Option<mpsc::Receiver<AuAssembly>> {
        self.assemblies_rx.take()
    }

    pub fn clock(&self) -> MonotonicClock {
        self.shared.clock.clone()
    }

    pub fn local_stream_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.stream_socket.local_addr()?)
    }

    pub fn local_control_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.control_socket.local_addr()?)
    }

    /// Repoint the control socket at the sender once its address is
    /// known (the two ends bootstrap each other's ports).
    pub async fn connect_control(&self, remote: SocketAddr) -> Result<()> {
        self.shared.control_socket.connect(remote).await?;
        Ok(())
    }

    /// Slot for the latest video statistics; whatever is present when
    /// the upload interval elapses is sent to the sender.
    pub fn video_stats_slot(&self) -> VideoStatsSlot {
        self.shared.video_stats_slot.clone()
    }

    pub async fn stats(&self) -> ReceiverStats {
        let st = self.shared.state.lock().await;
        ReceiverStats {
            packets_received: st.rtcp.packets_received,
            packets_lost: st.rtcp.packets_lost,
            out_of_order: st.out_of_order,
            duplicates: st.duplicates,
            untimely: st.untimely,
            access_units: st.access_units,
            access_units_dropped: st.access_units_dropped,
            jitter_rtp_units: st.rtcp.interarrival_jitter,
            clock_delta_avg_us: st.rtcp.clock_delta.clock_delta_avg_us,
        }
    }

    /// Sender NTP microseconds for an extended RTP timestamp, through the
    /// SR regression.
    pub async fn map_rtp_to_ntp_us(&self, ext_rtp_ts: u64) -> u64 {
        self.shared.state.lock().await.rtcp.ntp_us_from_rtp(ext_rtp_ts)
    }

    /// Stop both tasks and flush the pending access unit downstream.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.shared.should_stop.store(true, Ordering::SeqCst);
        self.shared.stop.notify_waiters();
        if let Some(h) = self.recv_handle.take() {
            let _ = h.await;
        }
        if let Some(h) = self.control_handle.take() {
            let _ = h.await;
        }
        self.stopped = true;
        Ok(())
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(h) = self.recv_handle.take() {
            h.abort();
        }
        if let Some(h) = self.control_handle.take() {
            h.abort();
        }
    }
}

async fn recv_loop(shared: Arc<ReceiverShared>) {
    tracing::info!("receiver stream loop started");
    loop {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = shared.stop.notified() => break,
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            r = shared.stream_socket.readable() => {
                if let Err(e) = r {
                    tracing::warn!("stream socket error: {e:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            }
        }
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }

        let mut st = shared.state.lock().await;
        let now = shared.clock.now_us();
        intake_batch(&shared, &mut st, now);

        // Depayload the in-order (or expired) prefix.
        let ReceiverState {
            packet_fifo,
            pool,
            depayloader,
            rtcp,
            ..
        } = &mut *st;
        let assemblies = depayloader.process(packet_fifo, pool, rtcp, now);
        for au in assemblies {
            st.access_units += 1;
            match shared.assemblies_tx.try_send(au) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    st.access_units_dropped += 1;
                    if st.access_units_dropped % 25 == 1 {
                        tracing::warn!(
                            "filter queue full, dropped {} access units so far",
                            st.access_units_dropped
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        maybe_send_reports(&shared, &mut st, now);
    }

    // Drain the pending access unit so downstream sees the tail.
    let mut st = shared.state.lock().await;
    let ReceiverState {
        depayloader, rtcp, ..
    } = &mut *st;
    if let Some(au) = depayloader.flush(rtcp) {
        let _ = shared.assemblies_tx.try_send(au);
    }
    let flushed = st.packet_fifo.flush(|_| {});
    let mut buf = Vec::with_capacity(64);
    rtcp::write_bye(
        &mut buf,
        &rtcp::Bye {
            ssrc: st.rtcp.ssrc,
            reason: Some("stream stopped".into()),
        },
    );
    let _ = shared.control_socket.try_send(&buf);
    tracing::info!("receiver stream loop stopped ({flushed} packets flushed)");
}

/// Drain the socket until it would block, filling pooled packet buffers.
fn intake_batch(shared: &ReceiverShared, st: &mut ReceiverState, now: u64) {
    loop {
        let mut packet = match st.packet_fifo.acquire() {
            Ok(p) => p,
            Err(_) => {
                // Pool exhausted: reclaim anything already expired and
                // retry once; otherwise leave the datagram in the kernel.
                st.packet_fifo.sweep_timeouts(now, |_| {});
                match st.packet_fifo.acquire() {
                    Ok(p) => p,
                    Err(_) => break,
                }
            }
        };
        let len = match shared.stream_socket.try_recv_from(&mut packet.buffer) {
            Ok((len, _from)) => len,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                st.packet_fifo.release(packet);
                break;
            }
            Err(e) => {
                st.packet_fifo.release(packet);
                tracing::warn!("stream recv failed: {e:#}");
                break;
            }
        };
        if let Err(e) = packet.parse_into(len) {
            tracing::debug!("dropping malformed packet: {e}");
            st.packet_fifo.release(packet);
            continue;
        }
        if packet.header.payload_type != PT_H264 {
            st.packet_fifo.release(packet);
            continue;
        }

        packet.ext_seq = st.seq_tracker.extend(packet.header.seq);
        packet.ext_rtp_ts = st.ts_tracker.extend(packet.header.timestamp);
        packet.input_time_us = now;
        packet.timeout_time_us = now + shared.reorder_timeout_us;

        // Too late: the depayloader has already moved past this slot.
        if let Some(last) = st.depayloader.last_consumed_seq() {
            if packet.ext_seq <= last {
                st.untimely += 1;
                st.packet_fifo
                    .drop_stats
                    .record(packet.importance, packet.len);
                st.packet_fifo.release(packet);
                continue;
            }
        }

        st.rtcp
            .on_packet_received(packet.ext_seq, packet.ext_rtp_ts, now);

        match st.packet_fifo.enqueue_ordered(packet) {
            InsertResult::InOrder => {}
            InsertResult::OutOfOrder(distance) => {
                st.out_of_order += 1;
                tracing::debug!("out-of-order arrival, {distance} places from the tail");
            }
            InsertResult::Duplicate => {
                st.duplicates += 1;
            }
        }
    }
}

/// Emit RR + SDES (+ clock-delta probe, + video stats) when due.
fn maybe_send_reports(shared: &ReceiverShared, st: &mut ReceiverState, now: u64) {
    if !shared.generate_receiver_reports || !st.rtcp.rr_due(now) {
        return;
    }
    if st.rtcp.sender_ssrc == 0 && st.rtcp.packets_received == 0 {
        // Nothing to report yet.
        return;
    }
    let rr = st.rtcp.generate_receiver_report(now);
    let mut buf = Vec::with_capacity(512);
    rtcp::write_receiver_report(&mut buf, &rr);
    let chunk = st.rtcp.sdes.due_chunk(st.rtcp.ssrc, now);
    rtcp::write_sdes(&mut buf, &chunk);

    // The clock-delta probe rides the report cadence (>= 100 ms).
    let delta = st.rtcp.clock_delta.generate(now);
    rtcp::write_clock_delta(&mut buf, st.rtcp.ssrc, &delta);

    if st.video_stats_window.due(now) {
        if let Some(stats) = shared.video_stats_slot.lock().unwrap().take() {
            rtcp::write_video_stats(&mut buf, st.rtcp.ssrc, &stats);
        }
    }

    if let Err(e) = shared.control_socket.try_send(&buf) {
        tracing::debug!("RR send failed: {e:#}");
    }
    st.rtcp.schedule_next_rr(buf.len());
}

async fn control_loop(shared: Arc<ReceiverShared>) {
    let mut buf = vec![0u8; 2048];
    tracing::info!("receiver control loop started");
    loop {
        let len = tokio::select! {
            _ = shared.stop.notified() => break,
            r = shared.control_socket.recv(&mut buf) => match r {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!("control recv failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        let data = &buf[..len];
        if !rtcp::is_rtcp(data) {
            continue;
        }
        let packets = match rtcp::parse_compound(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("malformed RTCP compound: {e}");
                continue;
            }
        };
        let now = shared.clock.now_us();
        let mut st = shared.state.lock().await;
        for packet in packets {
            match packet {
                rtcp::RtcpPacket::SenderReport { sr, .. } => {
                    let ext_rtp_ts = st.ts_tracker.extend(sr.rtp_timestamp);
                    st.rtcp.process_sender_report(&sr, ext_rtp_ts, now);
                }
                rtcp::RtcpPacket::ClockDelta { delta, .. } => {
                    st.rtcp.clock_delta.process(&delta, now);
                }
                rtcp::RtcpPacket::Bye(bye) => {
                    tracing::info!(
                        "sender {} said goodbye ({})",
                        bye.ssrc,
                        bye.reason.as_deref().unwrap_or("no reason")
                    );
                }
                _ => {}
            }
        }
    }
    tracing::info!("receiver control loop stopped");
}
