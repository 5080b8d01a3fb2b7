//! uavlink command-line tool: stream, receive and loop back H.264 video
//! over the drone-link protocol.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uavlink::h264::annexb;
use uavlink::h264::conceal::{
    write_gray_idr_slice, write_pps, write_skipped_p_slice, write_sps, SliceWriteContext, SpsConfig,
};
use uavlink::h264::filter::{AuConsumer, AuReadyStatus};
use uavlink::h264::NaluType;
use uavlink::{
    AccessUnit, FilterConfig, H264FileSink, NaluSubmission, ReceiverConfig, Sender, SenderConfig,
    StreamReceiver, StreamReceiverConfig,
};

#[derive(Parser)]
#[command(name = "uavlink")]
#[command(about = "Low-latency H.264 streaming for drone-to-ground links", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream H.264 video to a receiver
    Send {
        /// Receiver stream address (host:port)
        #[arg(long)]
        to: SocketAddr,

        /// Receiver control address (host:port)
        #[arg(long)]
        control: SocketAddr,

        /// Annex-B .h264 file to stream; omit for a generated test pattern
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Frames per second
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Sender configuration TOML
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop after this many frames (0 = unlimited)
        #[arg(long, default_value = "0")]
        frames: u64,
    },

    /// Receive a stream and print/record it
    Recv {
        /// Local stream bind address
        #[arg(long, default_value = "0.0.0.0:5004")]
        bind: SocketAddr,

        /// Local control bind address
        #[arg(long, default_value = "0.0.0.0:5005")]
        control_bind: SocketAddr,

        /// Sender control address (host:port)
        #[arg(long)]
        sender_control: Option<SocketAddr>,

        /// Record the raw elementary stream to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the stats sidecar to this file
        #[arg(long)]
        stats: Option<PathBuf>,

        /// Receiver configuration TOML
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a sender and receiver in-process over localhost
    Loopback {
        /// Number of test-pattern frames to stream
        #[arg(long, default_value = "90")]
        frames: u64,

        /// Frames per second
        #[arg(long, default_value = "30")]
        fps: u32,
    },
}

fn load_toml<T: serde::de::DeserializeOwned + Default>(path: &Option<PathBuf>) -> Result<T> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Send {
            to,
            control,
            input,
            fps,
            config,
            frames,
        } => run_send(to, control, input, fps, config, frames).await,
        Commands::Recv {
            bind,
            control_bind,
            sender_control,
            output,
            stats,
            config,
        } => run_recv(bind, control_bind, sender_control, output, stats, config).await,
        Commands::Loopback { frames, fps } => run_loopback(frames, fps).await,
    }
}

/// Generated gray test pattern: SPS+PPS+gray IDR, then full-frame
/// skipped-P pictures.
struct TestPattern {
    sps: Vec<u8>,
    pps: Vec<u8>,
    ctx: SliceWriteContext,
    mb_count: u32,
    frame_index: u64,
}

impl TestPattern {
    fn new(fps: u32) -> Self {
        let cfg = SpsConfig {
            mb_width: 80,
            mb_height: 45, // 1280x720
            framerate_num: fps.max(1),
            framerate_den: 1,
        };
        let ctx = SliceWriteContext {
            log2_max_frame_num: 4,
            pic_order_cnt_type: 2,
            nal_ref_idc: 2,
            ..Default::default()
        };
        Self {
            sps: write_sps(&cfg),
            pps: write_pps(),
            ctx,
            mb_count: 80 * 45,
            frame_index: 0,
        }
    }

    fn next_frame(&mut self) -> Result<Vec<Vec<u8>>> {
        let idr_interval: u64 = 30;
        let frame = if self.frame_index % idr_interval == 0 {
            let mut ctx = self.ctx.clone();
            ctx.frame_num = 0;
            ctx.nal_ref_idc = 3;
            let slice = write_gray_idr_slice(&ctx, self.mb_count)?;
            vec![self.sps.clone(), self.pps.clone(), slice]
        } else {
            let mut ctx = self.ctx.clone();
            ctx.frame_num = ((self.frame_index % idr_interval) % 16) as u32;
            let slice = write_skipped_p_slice(&ctx, 0, self.mb_count)?;
            vec![slice]
        };
        self.frame_index += 1;
        Ok(frame)
    }
}

/// Group an Annex-B stream into access units: each slice NAL ends one.
fn file_access_units(data: &[u8]) -> Vec<Vec<Vec<u8>>> {
    let mut aus = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    for nalu in annexb::split(data) {
        let ty = NaluType::from_header(nalu[0]);
        current.push(nalu.to_vec());
        if ty.is_slice() {
            aus.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        aus.push(current);
    }
    aus
}

async fn run_send(
    to: SocketAddr,
    control: SocketAddr,
    input: Option<PathBuf>,
    fps: u32,
    config: Option<PathBuf>,
    frames: u64,
) -> Result<()> {
    let cfg: SenderConfig = load_toml(&config)?;
    let mut sender = Sender::start(
        cfg,
        "0.0.0.0:0".parse().unwrap(),
        "0.0.0.0:0".parse().unwrap(),
        to,
        control,
        Box::new(uavlink::h264::payloader::NullEvents),
    )
    .await
    .context("starting sender")?;

    let file_aus = match &input {
        Some(path) => {
            let data =
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let aus = file_access_units(&data);
            anyhow::ensure!(!aus.is_empty(), "no NAL units found in {}", path.display());
            tracing::info!("streaming {} access units from {}", aus.len(), path.display());
            Some(aus)
        }
        None => {
            tracing::info!("streaming generated 1280x720 test pattern");
            None
        }
    };
    let mut pattern = TestPattern::new(fps);

    let clock = sender.clock();
    let mut interval = tokio::time::interval(Duration::from_micros(1_000_000 / fps.max(1) as u64));
    let mut frame_index = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        if frames > 0 && frame_index >= frames {
            break;
        }
        let nalus = match &file_aus {
            Some(aus) => aus[(frame_index % aus.len() as u64) as usize].clone(),
            None => pattern.next_frame()?,
        };
        let submissions = nalus
            .into_iter()
            .map(|n| {
                let importance = match NaluType::from_header(n[0]) {
                    NaluType::Sps | NaluType::Pps | NaluType::SliceIdr => 0,
                    NaluType::Sei => 2,
                    _ => 1,
                };
                let mut sub = NaluSubmission::new(Bytes::from(n));
                sub.importance = importance;
                sub.nalu_token = frame_index;
                sub
            })
            .collect();
        if let Err(e) = sender
            .submit_au(submissions, None, clock.now_us(), frame_index + 1)
            .await
        {
            tracing::warn!("submission failed: {e}");
        }
        frame_index += 1;

        if frame_index % 300 == 0 {
            let link = sender.link_report().await;
            tracing::info!(
                "sent {} frames; link rtt {:.1} ms, jitter {:.1} ms, fraction lost {}/256",
                frame_index,
                link.round_trip_delay_us as f64 / 1000.0,
                link.interarrival_jitter_us as f64 / 1000.0,
                link.fraction_lost
            );
        }
    }

    tracing::info!("stopping after {frame_index} frames");
    sender.stop().await?;
    Ok(())
}

/// Consumer that counts delivered access units.
struct PrintingConsumer {
    delivered: Arc<AtomicU64>,
}

impl AuConsumer for PrintingConsumer {
    fn get_au_buffer(&mut self, size_hint: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; size_hint])
    }

    fn au_ready(&mut self, _buffer: Vec<u8>, len: usize, au: &AccessUnit) -> AuReadyStatus {
        let n = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 100 == 1 {
            tracing::info!(
                "AU #{n}: {len} bytes, sync {:?}, complete {}, ts {} us",
                au.sync_type,
                au.is_complete,
                au.ntp_time_us
            );
        }
        AuReadyStatus::Ok
    }

    fn sps_pps(&mut self, sps: &[u8], pps: &[u8]) {
        tracing::info!("SPS/PPS acquired ({} / {} bytes)", sps.len(), pps.len());
    }
}

async fn run_recv(
    bind: SocketAddr,
    control_bind: SocketAddr,
    sender_control: Option<SocketAddr>,
    output: Option<PathBuf>,
    stats: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<()> {
    let receiver_cfg: ReceiverConfig = load_toml(&config)?;
    let delivered = Arc::new(AtomicU64::new(0));
    let consumer = PrintingConsumer {
        delivered: delivered.clone(),
    };

    let stream_cfg = StreamReceiverConfig {
        receiver: receiver_cfg,
        filter: FilterConfig {
            generate_skipped_p_slices: true,
            output_incomplete_au: true,
            ..Default::default()
        },
        stats_path: stats,
    };
    // Until the sender's address is known, reports go nowhere.
    let remote_control = sender_control.unwrap_or_else(|| "127.0.0.1:9".parse().unwrap());
    let mut stream = StreamReceiver::start(
        stream_cfg,
        bind,
        control_bind,
        remote_control,
        Box::new(consumer),
    )
    .await
    .context("starting receiver")?;

    if let Some(path) = &output {
        stream
            .start_recorder(Box::new(H264FileSink::create(path)?))
            .await;
        tracing::info!("recording raw stream to {}", path.display());
    }

    tracing::info!("receiving on {bind}, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let stats = stream.stats().await;
    tracing::info!(
        "received {} packets ({} lost, {} out of order, {} duplicates, {} late), {} access units",
        stats.packets_received,
        stats.packets_lost,
        stats.out_of_order,
        stats.duplicates,
        stats.untimely,
        stats.access_units
    );
    stream.stop().await?;
    Ok(())
}

async fn run_loopback(frames: u64, fps: u32) -> Result<()> {
    let delivered = Arc::new(AtomicU64::new(0));
    let consumer = PrintingConsumer {
        delivered: delivered.clone(),
    };
    let mut stream = StreamReceiver::start(
        StreamReceiverConfig::default(),
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:9".parse().unwrap(),
        Box::new(consumer),
    )
    .await?;

    let mut sender = Sender::start(
        SenderConfig::default(),
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
        stream.local_stream_addr()?,
        stream.local_control_addr()?,
        Box::new(uavlink::h264::payloader::NullEvents),
    )
    .await?;
    stream.connect_control(sender.local_control_addr()?).await?;

    let clock = sender.clock();
    let mut pattern = TestPattern::new(fps);
    let mut interval = tokio::time::interval(Duration::from_micros(1_000_000 / fps.max(1) as u64));
    for token in 0..frames {
        interval.tick().await;
        let nalus = pattern
            .next_frame()?
            .into_iter()
            .map(|n| NaluSubmission::new(Bytes::from(n)))
            .collect();
        sender.submit_au(nalus, None, clock.now_us(), token + 1).await?;
    }
    // Let the tail drain.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = stream.stats().await;
    let consumed = delivered.load(Ordering::Relaxed);
    tracing::info!(
        "loopback done: {frames} frames sent, {} access units reassembled, {} delivered, {} packets ({} lost)",
        stats.access_units,
        consumed,
        stats.packets_received,
        stats.packets_lost
    );
    sender.stop().await?;
    stream.stop().await?;
    anyhow::ensure!(consumed > 0, "no access units reached the consumer");
    Ok(())
}
