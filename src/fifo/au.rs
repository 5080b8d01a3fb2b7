//! Access units, the refcounted AU buffer pool and multi-consumer fan-out.
//!
//! An access unit that must reach several consumers is duplicated *by
//! descriptor* while the payload buffer is shared: the descriptor clones
//! an `Arc` handle onto the pooled buffer. A buffer returns to the pool
//! exactly when the last handle drops, so pool occupancy is the live
//! refcount balance.

use std::ops::{Deref, DerefMut};
use std::sync::mpsc;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::h264::{AuSyncType, NaluType, SliceType};

/// Payload and sidecar storage for one access unit.
///
/// The vectors keep their high-water capacity across reuse, so the
/// steady state allocates nothing.
#[derive(Debug, Default)]
pub struct AuBufferSet {
    /// Concatenated NAL units (with whatever framing the depayloader
    /// applies).
    pub data: Vec<u8>,
    /// Vendor telemetry copied from the RTP header extension.
    pub metadata: Vec<u8>,
    /// SEI user data captured by the filter.
    pub user_data: Vec<u8>,
    /// One status byte per macroblock (see [`crate::h264::MbStatus`]).
    pub mb_status: Vec<u8>,
    /// Serialized video statistics snapshot.
    pub video_stats: Vec<u8>,
}

impl AuBufferSet {
    fn clear(&mut self) {
        self.data.clear();
        self.metadata.clear();
        self.user_data.clear();
        self.mb_status.clear();
        self.video_stats.clear();
    }
}

/// Exclusive handle on a pool slot; returns the storage to the pool on
/// drop.
#[derive(Debug)]
pub struct PooledAuBuffer {
    set: Option<AuBufferSet>,
    home: mpsc::Sender<AuBufferSet>,
}

impl Deref for PooledAuBuffer {
    type Target = AuBufferSet;
    fn deref(&self) -> &AuBufferSet {
        self.set.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledAuBuffer {
    fn deref_mut(&mut self) -> &mut AuBufferSet {
        self.set.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledAuBuffer {
    fn drop(&mut self) {
        if let Some(mut set) = self.set.take() {
            set.clear();
            // If the pool is gone the storage is simply freed.
            let _ = self.home.send(set);
        }
    }
}

/// Shared, immutable handle on a sealed AU buffer.
pub type SharedAuBuffer = Arc<PooledAuBuffer>;

/// Sizing of one AU buffer slot.
#[derive(Debug, Clone, Copy)]
pub struct AuPoolConfig {
    pub slots: usize,
    pub data_capacity: usize,
    pub metadata_capacity: usize,
    pub sidecar_capacity: usize,
}

impl Default for AuPoolConfig {
    fn default() -> Self {
        Self {
            slots: 16,
            data_capacity: 256 * 1024,
            metadata_capacity: 1024,
            sidecar_capacity: 8 * 1024,
        }
    }
}

/// Fixed-size pool of AU buffer slots.
#[derive(Debug)]
pub struct AuBufferPool {
    spares: Vec<AuBufferSet>,
    returns: mpsc::Receiver<AuBufferSet>,
    home: mpsc::Sender<AuBufferSet>,
    slots: usize,
}

impl AuBufferPool {
    pub fn new(cfg: AuPoolConfig) -> Result<Self> {
        if cfg.slots == 0 {
            return Err(Error::BadParameters("AU pool needs at least one slot".into()));
        }
        let (home, returns) = mpsc::channel();
        let mut spares = Vec::with_capacity(cfg.slots);
        for _ in 0..cfg.slots {
            spares.push(AuBufferSet {
                data: Vec::with_capacity(cfg.data_capacity),
                metadata: Vec::with_capacity(cfg.metadata_capacity),
                user_data: Vec::with_capacity(cfg.metadata_capacity),
                mb_status: Vec::with_capacity(cfg.sidecar_capacity),
                video_stats: Vec::with_capacity(512),
            });
        }
        Ok(Self {
            spares,
            returns,
            home,
            slots: cfg.slots,
        })
    }

    fn reclaim(&mut self) {
        while let Ok(set) = self.returns.try_recv() {
            self.spares.push(set);
        }
    }

    /// Take a free slot; fails with `QueueFull` when every slot is still
    /// referenced downstream.
    pub fn acquire(&mut self) -> Result<PooledAuBuffer> {
        self.reclaim();
        let set = self
            .spares
            .pop()
            .ok_or_else(|| Error::QueueFull("AU buffer pool exhausted".into()))?;
        Ok(PooledAuBuffer {
            set: Some(set),
            home: self.home.clone(),
        })
    }

    /// Number of slots currently free; equals `slots()` once every
    /// consumer has released its handles.
    pub fn available(&mut self) -> usize {
        self.reclaim();
        self.spares.len()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

/// One NAL unit inside a sealed access unit, as a range into the AU data
/// buffer (framing bytes included in the range).
#[derive(Debug, Clone, Copy)]
pub struct NaluInfo {
    pub offset: usize,
    pub len: usize,
    pub nalu_type: NaluType,
    pub slice_type: SliceType,
    /// Sequence gap observed immediately before this NALU.
    pub missing_packets_before: u32,
    pub is_last_in_au: bool,
}

/// A completed access unit fanned out to the consumers.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nalus: Vec<NaluInfo>,
    pub buffer: SharedAuBuffer,

    /// Sender-clock timestamp mapped through the SR regression.
    pub ntp_time_us: u64,
    /// Raw sender timestamp before clock mapping.
    pub ntp_time_raw_us: u64,
    /// Local reception timestamp.
    pub ntp_time_local_us: u64,
    pub ext_rtp_ts: u64,
    pub rtp_ts: u32,

    pub sync_type: AuSyncType,
    pub is_complete: bool,
    pub has_errors: bool,
    pub is_ref: bool,
}

impl AccessUnit {
    /// Bytes of one NAL unit within the shared buffer.
    pub fn nalu_bytes(&self, info: &NaluInfo) -> &[u8] {
        &self.buffer.data[info.offset..info.offset + info.len]
    }

    /// Total payload size.
    pub fn size(&self) -> usize {
        self.buffer.data.len()
    }
}

/// Assembly state for an access unit being reconstructed; sealed into an
/// [`AccessUnit`] when its boundary is reached.
#[derive(Debug)]
pub struct AuAssembly {
    buf: PooledAuBuffer,
    pub nalus: Vec<NaluInfo>,
    pub ntp_time_us: u64,
    pub ntp_time_raw_us: u64,
    pub ntp_time_local_us: u64,
    pub ext_rtp_ts: u64,
    pub rtp_ts: u32,
    pub has_errors: bool,
    /// True when the AU was closed by the RTP marker bit rather than a
    /// timestamp change (a timestamp change means the tail was lost).
    pub ended_on_marker: bool,
}

impl AuAssembly {
    pub fn new(buf: PooledAuBuffer) -> Self {
        Self {
            buf,
            nalus: Vec::new(),
            ntp_time_us: 0,
            ntp_time_raw_us: 0,
            ntp_time_local_us: 0,
            ext_rtp_ts: 0,
            rtp_ts: 0,
            has_errors: false,
            ended_on_marker: false,
        }
    }

    pub fn data_len(&self) -> usize {
        self.buf.data.len()
    }

    pub fn nalu_count(&self) -> usize {
        self.nalus.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.data.extend_from_slice(bytes);
    }

    /// Roll the data buffer back to `len` (dropping an aborted partial
    /// NAL unit).
    pub fn truncate(&mut self, len: usize) {
        self.buf.data.truncate(len);
    }

    pub fn set_metadata(&mut self, bytes: &[u8]) {
        self.buf.metadata.clear();
        self.buf.metadata.extend_from_slice(bytes);
    }

    pub fn push_nalu(&mut self, info: NaluInfo) {
        self.nalus.push(info);
    }

    /// Bytes of one NAL unit within the assembly buffer.
    pub fn nalu_bytes(&self, info: &NaluInfo) -> &[u8] {
        &self.buf.data[info.offset..info.offset + info.len]
    }

    pub fn buffer(&self) -> &AuBufferSet {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut AuBufferSet {
        &mut self.buf
    }

    /// Close the AU and produce the shared descriptor.
    pub fn seal(mut self, sync_type: AuSyncType, is_complete: bool, is_ref: bool) -> AccessUnit {
        if let Some(last) = self.nalus.last_mut() {
            last.is_last_in_au = true;
        }
        AccessUnit {
            nalus: self.nalus,
            buffer: Arc::new(self.buf),
            ntp_time_us: self.ntp_time_us,
            ntp_time_raw_us: self.ntp_time_raw_us,
            ntp_time_local_us: self.ntp_time_local_us,
            ext_rtp_ts: self.ext_rtp_ts,
            rtp_ts: self.rtp_ts,
            sync_type,
            is_complete,
            has_errors: self.has_errors,
            is_ref,
        }
    }
}

/// One registered consumer queue.
#[derive(Debug)]
struct FanoutQueue {
    name: String,
    tx: tokio::sync::mpsc::Sender<AccessUnit>,
    dropped: u64,
}

/// Fan-out of access units to any number of named consumer queues.
///
/// A full queue drops its duplicated descriptor (unreferencing the shared
/// buffer); the other queues are unaffected.
#[derive(Debug, Default)]
pub struct AuFanout {
    queues: Vec<FanoutQueue>,
}

impl AuFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer queue of the given depth, returning its
    /// receiving end.
    pub fn register(&mut self, name: &str, depth: usize) -> tokio::sync::mpsc::Receiver<AccessUnit> {
        let (tx, rx) = tokio::sync::mpsc::channel(depth.max(1));
        self.queues.push(FanoutQueue {
            name: name.to_string(),
            tx,
            dropped: 0,
        });
        rx
    }

    /// Remove queues whose receiver side is gone.
    pub fn prune_closed(&mut self) {
        self.queues.retain(|q| !q.tx.is_closed());
    }

    /// Duplicate `au` into every registered queue.
    pub fn dispatch(&mut self, au: &AccessUnit) {
        for q in &mut self.queues {
            match q.tx.try_send(au.clone()) {
                Ok(()) => {}
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    q.dropped += 1;
                    if q.dropped % 50 == 1 {
                        tracing::warn!(
                            "AU queue '{}' full, dropped {} access units so far",
                            q.name,
                            q.dropped
                        );
                    }
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn dropped(&self, name: &str) -> u64 {
        self.queues
            .iter()
            .find(|q| q.name == name)
            .map(|q| q.dropped)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(slots: usize) -> AuBufferPool {
        AuBufferPool::new(AuPoolConfig {
            slots,
            data_capacity: 1024,
            metadata_capacity: 64,
            sidecar_capacity: 128,
        })
        .unwrap()
    }

    #[test]
    fn test_pool_refcount_balance() {
        let mut pool = small_pool(2);
        assert_eq!(pool.available(), 2);

        let mut buf = pool.acquire().unwrap();
        buf.data.extend_from_slice(&[1, 2, 3]);
        assert_eq!(pool.available(), 1);

        let shared: SharedAuBuffer = Arc::new(buf);
        let dup = shared.clone();
        drop(shared);
        // Still referenced by `dup`.
        assert_eq!(pool.available(), 1);

        drop(dup);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_exhaustion_is_queue_full() {
        let mut pool = small_pool(1);
        let _held = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(Error::QueueFull(_))));
    }

    #[test]
    fn test_reused_buffer_is_cleared_but_keeps_capacity() {
        let mut pool = small_pool(1);
        let mut buf = pool.acquire().unwrap();
        buf.data.extend_from_slice(&[0u8; 600]);
        buf.metadata.extend_from_slice(&[1, 2]);
        drop(buf);

        let buf = pool.acquire().unwrap();
        assert!(buf.data.is_empty());
        assert!(buf.metadata.is_empty());
        assert!(buf.data.capacity() >= 600);
    }

    fn sealed_au(pool: &mut AuBufferPool) -> AccessUnit {
        let buf = pool.acquire().unwrap();
        let mut asm = AuAssembly::new(buf);
        asm.append(&[0, 0, 0, 1, 0x65, 0xAA]);
        asm.push_nalu(NaluInfo {
            offset: 0,
            len: 6,
            nalu_type: NaluType::SliceIdr,
            slice_type: SliceType::I,
            missing_packets_before: 0,
            is_last_in_au: false,
        });
        asm.ext_rtp_ts = 90_000;
        asm.seal(AuSyncType::Idr, true, true)
    }

    #[test]
    fn test_assembly_seal_marks_last_nalu() {
        let mut pool = small_pool(1);
        let au = sealed_au(&mut pool);
        assert!(au.nalus.last().unwrap().is_last_in_au);
        assert_eq!(au.nalu_bytes(&au.nalus[0]), &[0, 0, 0, 1, 0x65, 0xAA]);
        assert_eq!(au.size(), 6);
    }

    #[tokio::test]
    async fn test_fanout_shares_one_buffer() {
        let mut pool = small_pool(1);
        let mut fanout = AuFanout::new();
        let mut rx_a = fanout.register("decoder", 4);
        let mut rx_b = fanout.register("recorder", 4);

        let au = sealed_au(&mut pool);
        fanout.dispatch(&au);
        drop(au);

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a.buffer, &b.buffer));
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_fanout_backpressure_drops_only_full_queue() {
        let mut pool = small_pool(4);
        let mut fanout = AuFanout::new();
        let mut rx_primary = fanout.register("primary", 4);
        let _rx_slow = fanout.register("slow", 1);

        for _ in 0..3 {
            let au = sealed_au(&mut pool);
            fanout.dispatch(&au);
        }
        assert_eq!(fanout.dropped("slow"), 2);
        assert_eq!(fanout.dropped("primary"), 0);
        // Primary still receives all three.
        for _ in 0..3 {
            assert!(rx_primary.try_recv().is_ok());
        }
    }
}
