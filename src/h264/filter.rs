//! H.264 stream filter: parameter-set synchronization, access-unit
//! classification, optional NAL filtering and rewriting, and error
//! concealment dispatch.
//!
//! The filter consumes access-unit assemblies from the depayloader,
//! classifies them (IDR / I-frame / intra-refresh start), patches missing
//! slice ranges, then copies the surviving NAL units into a buffer the
//! consumer provides. A consumer that lost its reference picture returns
//! [`AuReadyStatus::ResyncRequired`] and receives a synthesized gray IDR
//! in front of the next slice-bearing access unit.

use crate::error::{Error, Result};
use crate::fifo::au::{AccessUnit, AuAssembly, AuBufferPool, NaluInfo};
use crate::rtcp::VideoStats;

use super::conceal::{write_gray_idr_slice, write_skipped_p_slice, SliceWriteContext};
use super::param::{parse_pps, parse_slice_header, parse_sps, PpsInfo, SliceHeader, SpsInfo};
use super::sei::{parse_sei, SeiMessage, StreamingInfo};
use super::{mb_zone, AuSyncType, MbStatus, NaluType, SliceType, START_CODE};

/// Filter configuration.
#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    /// Hold back output until SPS and PPS have been seen.
    pub wait_for_sync: bool,
    /// Deliver access units with missing slices to the consumer.
    pub output_incomplete_au: bool,
    pub filter_out_sps_pps: bool,
    pub filter_out_sei: bool,
    /// Rewrite each 4-byte start code to a big-endian NALU length.
    pub replace_start_codes_with_nalu_size: bool,
    /// Patch missing slice ranges with synthesized skipped-P slices.
    pub generate_skipped_p_slices: bool,
    /// Seed the decoder with a gray IDR before the first output.
    pub generate_first_gray_i_frame: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            wait_for_sync: true,
            output_incomplete_au: false,
            filter_out_sps_pps: false,
            filter_out_sei: false,
            replace_start_codes_with_nalu_size: false,
            generate_skipped_p_slices: false,
            generate_first_gray_i_frame: false,
        }
    }
}

/// Consumer verdict on a delivered access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuReadyStatus {
    Ok,
    /// The decoder lost its reference; insert a gray IDR.
    ResyncRequired,
}

/// Per-instance consumer interface (e.g. a hardware decoder front-end).
pub trait AuConsumer: Send {
    /// Provide a buffer of at least `size_hint` bytes for one access
    /// unit. Returning `None` aborts delivery of that AU.
    fn get_au_buffer(&mut self, size_hint: usize) -> Option<Vec<u8>>;

    /// Receive one filtered access unit: the buffer previously handed
    /// out, the number of valid bytes, and the descriptor with
    /// timestamps, sync type and sidecar data.
    fn au_ready(&mut self, buffer: Vec<u8>, len: usize, au: &AccessUnit) -> AuReadyStatus;

    /// Called once when SPS/PPS synchronization is acquired or changes.
    fn sps_pps(&mut self, _sps: &[u8], _pps: &[u8]) {}
}

#[derive(Debug, Default)]
struct SliceRecord {
    nalu_index: usize,
    first_mb: u32,
    header: SliceHeader,
}

/// Parsed view of one assembly, gathered before any rewriting.
#[derive(Debug, Default)]
struct AuScan {
    slices: Vec<SliceRecord>,
    streaming: Option<StreamingInfo>,
    any_idr: bool,
    all_slices_i: bool,
    is_ref: bool,
    sps_changed: bool,
    pps_changed: bool,
}

/// H.264 filter instance.
pub struct H264Filter {
    cfg: FilterConfig,
    consumer: Box<dyn AuConsumer>,

    sync: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    sps_info: Option<SpsInfo>,
    pps_info: Option<PpsInfo>,
    mb_width: usize,
    mb_height: usize,
    mb_count: usize,
    pub framerate: Option<f32>,

    gray_idr_pending: bool,
    writer_ctx: Option<SliceWriteContext>,
    previous_frame_num: Option<u32>,

    /// Running statistics uploaded to the sender and written to the
    /// stats sidecar.
    pub stats: VideoStats,
    errored_second_start_us: u64,
    errored_second_start_by_zone_us: [u64; super::MB_STATUS_ZONE_COUNT],
    mb_status_scratch: Vec<u8>,
    output_index: u64,
}

impl H264Filter {
    pub fn new(cfg: FilterConfig, consumer: Box<dyn AuConsumer>) -> Result<Self> {
        if cfg.generate_first_gray_i_frame && !cfg.wait_for_sync {
            return Err(Error::BadParameters(
                "generate_first_gray_i_frame requires wait_for_sync".into(),
            ));
        }
        Ok(Self {
            cfg,
            consumer,
            sync: false,
            sps: None,
            pps: None,
            sps_info: None,
            pps_info: None,
            mb_width: 0,
            mb_height: 0,
            mb_count: 0,
            framerate: None,
            gray_idr_pending: false,
            writer_ctx: None,
            previous_frame_num: None,
            stats: VideoStats::default(),
            errored_second_start_us: 0,
            errored_second_start_by_zone_us: [0; super::MB_STATUS_ZONE_COUNT],
            mb_status_scratch: Vec::new(),
            output_index: 0,
        })
    }

    pub fn is_synced(&self) -> bool {
        self.sync
    }

    /// SPS and PPS bytes once synchronized.
    pub fn sps_pps(&self) -> Result<(&[u8], &[u8])> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) if self.sync => Ok((sps, pps)),
            _ => Err(Error::WaitingForSync),
        }
    }

    pub fn mb_dimensions(&self) -> (usize, usize) {
        (self.mb_width, self.mb_height)
    }

    /// Process one assembled access unit. Returns the sealed units to
    /// fan out downstream (a synthesized gray IDR may precede the real
    /// one); an empty vector means the AU was withheld.
    pub fn process_assembly(
        &mut self,
        mut au: AuAssembly,
        pool: &mut AuBufferPool,
    ) -> Result<Vec<AccessUnit>> {
        self.stats.total_frame_count += 1;

        let scan = self.scan(&mut au)?;

        if !self.sync && self.cfg.wait_for_sync {
            self.stats.discarded_frame_count += 1;
            tracing::debug!("discarding access unit before SPS/PPS sync");
            return Ok(Vec::new());
        }

        // Frame-number discontinuities mean whole pictures never arrived.
        if let (Some(prev), Some(first)) = (self.previous_frame_num, scan.slices.first()) {
            if self.sync && !scan.any_idr {
                let max_frame_num = 1u32
                    << self
                        .sps_info
                        .as_ref()
                        .map(|s| s.log2_max_frame_num)
                        .unwrap_or(4);
                let expected_delta = if scan.is_ref { 1 } else { 0 };
                let delta = first.header.frame_num.wrapping_sub(prev) % max_frame_num;
                if delta > expected_delta {
                    self.stats.missed_frame_count += (delta - expected_delta) as u32;
                }
            }
        }
        if let Some(first) = scan.slices.first() {
            self.previous_frame_num = Some(first.header.frame_num);
        }

        let mut outputs = Vec::new();

        // A pending resync produces a gray IDR stamped just before this
        // AU, but only once a slice context exists to inherit from.
        if self.gray_idr_pending && self.sync && !scan.slices.is_empty() {
            match self.build_gray_idr(&au, pool) {
                Ok(gray) => {
                    self.gray_idr_pending = false;
                    self.emit_to_consumer(&gray);
                    outputs.push(gray);
                }
                Err(e) => tracing::warn!("gray IDR synthesis failed: {e}"),
            }
        }

        let sealed = self.conceal_and_seal(au, scan)?;

        let deliver = sealed.is_complete || self.cfg.output_incomplete_au;
        if deliver {
            self.emit_to_consumer(&sealed);
        } else {
            self.stats.discarded_frame_count += 1;
        }
        self.account_stats(&sealed);
        outputs.push(sealed);
        Ok(outputs)
    }

    /// First pass: parameter sets, SEI, slice headers.
    fn scan(&mut self, au: &mut AuAssembly) -> Result<AuScan> {
        let mut scan = AuScan {
            all_slices_i: true,
            ..Default::default()
        };
        let mut user_data: Option<Vec<u8>> = None;

        for index in 0..au.nalus.len() {
            let info = au.nalus[index];
            let bytes = strip_start_code(au.nalu_bytes(&info)).to_vec();
            if bytes.is_empty() {
                continue;
            }
            match info.nalu_type {
                NaluType::Sps => {
                    if self.sps.as_deref() != Some(bytes.as_slice()) {
                        match parse_sps(&bytes) {
                            Ok(parsed) => {
                                self.sps = Some(bytes);
                                self.sps_info = Some(parsed);
                                scan.sps_changed = true;
                            }
                            Err(e) => tracing::warn!("SPS parse failed: {e}"),
                        }
                    }
                }
                NaluType::Pps => {
                    if self.pps.as_deref() != Some(bytes.as_slice()) {
                        match parse_pps(&bytes) {
                            Ok(parsed) => {
                                self.pps = Some(bytes);
                                self.pps_info = Some(parsed);
                                scan.pps_changed = true;
                            }
                            Err(e) => tracing::warn!("PPS parse failed: {e}"),
                        }
                    }
                }
                NaluType::Sei => match parse_sei(&bytes) {
                    Ok(messages) => {
                        for msg in messages {
                            match msg {
                                SeiMessage::Streaming(info) => scan.streaming = Some(info),
                                SeiMessage::UserData(_, data) => user_data = Some(data),
                                SeiMessage::Other(_, _) => {}
                            }
                        }
                    }
                    Err(e) => tracing::debug!("SEI parse failed: {e}"),
                },
                NaluType::Slice | NaluType::SliceIdr => {
                    if info.nalu_type == NaluType::SliceIdr {
                        scan.any_idr = true;
                    }
                    if let (Some(sps), Some(pps)) = (&self.sps_info, &self.pps_info) {
                        match parse_slice_header(&bytes, sps, pps) {
                            Ok(header) => {
                                if header.slice_type != SliceType::I {
                                    scan.all_slices_i = false;
                                }
                                if header.nal_ref_idc != 0 {
                                    scan.is_ref = true;
                                }
                                au.nalus[index].slice_type = header.slice_type;
                                self.writer_ctx = Some(SliceWriteContext::from_stream(
                                    sps, pps, &header,
                                ));
                                scan.slices.push(SliceRecord {
                                    nalu_index: index,
                                    first_mb: header.first_mb_in_slice,
                                    header,
                                });
                            }
                            Err(e) => {
                                tracing::debug!("slice header parse failed: {e}");
                                scan.all_slices_i = false;
                            }
                        }
                    } else {
                        scan.all_slices_i = false;
                    }
                }
                _ => {}
            }
        }

        if let Some(data) = user_data {
            let buf = au.buffer_mut();
            buf.user_data.clear();
            buf.user_data.extend_from_slice(&data);
        }

        if (scan.sps_changed || scan.pps_changed) && self.sps.is_some() && self.pps.is_some() {
            self.on_sync()?;
        }
        Ok(scan)
    }

    fn on_sync(&mut self) -> Result<()> {
        let sps = self.sps_info.as_ref().expect("checked by caller");
        self.mb_width = sps.mb_width as usize;
        self.mb_height = sps.mb_height as usize;
        self.mb_count = sps.mb_count() as usize;
        self.framerate = sps.framerate;
        let newly_synced = !self.sync;
        self.sync = true;
        tracing::info!(
            "SPS/PPS sync: {}x{} MBs, {:.2} fps",
            self.mb_width,
            self.mb_height,
            self.framerate.unwrap_or(0.0)
        );
        let (sps_bytes, pps_bytes) = (
            self.sps.clone().expect("checked"),
            self.pps.clone().expect("checked"),
        );
        self.consumer.sps_pps(&sps_bytes, &pps_bytes);
        if newly_synced && self.cfg.generate_first_gray_i_frame {
            self.gray_idr_pending = true;
        }
        Ok(())
    }

    /// Second pass: derive per-macroblock status, patch missing slice
    /// ranges, classify and seal.
    fn conceal_and_seal(&mut self, mut au: AuAssembly, scan: AuScan) -> Result<AccessUnit> {
        let sync_type = if scan.any_idr {
            AuSyncType::Idr
        } else if !scan.slices.is_empty() && scan.all_slices_i {
            AuSyncType::IFrame
        } else if scan.streaming.as_ref().map(|s| s.index_in_gop) == Some(0) {
            AuSyncType::PirStart
        } else {
            AuSyncType::None
        };

        let mut complete = au.ended_on_marker && !au.has_errors;

        if self.sync && self.mb_count > 0 && !scan.slices.is_empty() {
            self.mb_status_scratch.clear();
            self.mb_status_scratch
                .resize(self.mb_count, MbStatus::Unknown as u8);

            let mut inserts: Vec<(usize, Vec<u8>, SliceType)> = Vec::new();
            let mut expected_mb: u32 = 0;

            for (i, slice) in scan.slices.iter().enumerate() {
                // Gap in the macroblock address space before this slice.
                if slice.first_mb > expected_mb {
                    let missing = slice.first_mb - expected_mb;
                    complete = false;
                    self.patch_gap(
                        expected_mb,
                        missing,
                        &slice.header,
                        slice.nalu_index,
                        &mut inserts,
                    );
                }

                // Extent of this slice: announced by the streaming info,
                // otherwise inferred from the next slice or the image end.
                let slice_mbs = self
                    .announced_slice_mbs(scan.streaming.as_ref(), slice.first_mb)
                    .unwrap_or_else(|| {
                        scan.slices
                            .get(i + 1)
                            .map(|next| next.first_mb.saturating_sub(slice.first_mb))
                            .unwrap_or(self.mb_count as u32 - slice.first_mb)
                    });
                let status = if slice.header.slice_type == SliceType::I {
                    MbStatus::ValidISlice
                } else {
                    MbStatus::ValidPSlice
                };
                self.mark_mb_range(slice.first_mb, slice_mbs, status);
                expected_mb = slice.first_mb + slice_mbs;
            }

            // Missing end of frame.
            if (expected_mb as usize) < self.mb_count {
                let last = scan.slices.last().expect("nonempty");
                if !au.ended_on_marker || au.has_errors {
                    complete = false;
                    let missing = self.mb_count as u32 - expected_mb;
                    self.patch_end_gap(expected_mb, missing, &last.header, &mut inserts);
                }
            }

            // Splice synthesized slices into the NALU list; payloads go
            // at the end of the data buffer, order is the index list.
            // Later indices first so earlier insertions stay valid.
            inserts.sort_by(|a, b| b.0.cmp(&a.0));
            for (index, nalu, slice_type) in inserts {
                let offset = au.data_len();
                au.append(&START_CODE);
                au.append(&nalu);
                let len = au.data_len() - offset;
                au.nalus.insert(
                    index.min(au.nalus.len()),
                    NaluInfo {
                        offset,
                        len,
                        nalu_type: NaluType::Slice,
                        slice_type,
                        missing_packets_before: 0,
                        is_last_in_au: false,
                    },
                );
            }

            let buf = au.buffer_mut();
            buf.mb_status.clear();
            buf.mb_status.extend_from_slice(&self.mb_status_scratch);
        }

        au.has_errors = au.has_errors || !complete;
        Ok(au.seal(sync_type, complete, scan.is_ref))
    }

    /// Announced macroblock count of the slice starting at `first_mb`,
    /// from the streaming-info slice table.
    fn announced_slice_mbs(&self, streaming: Option<&StreamingInfo>, first_mb: u32) -> Option<u32> {
        let streaming = streaming?;
        let mut cursor = 0u32;
        for &count in &streaming.slice_mb_count {
            if cursor == first_mb {
                return Some(count as u32);
            }
            cursor += count as u32;
        }
        None
    }

    fn mark_mb_range(&mut self, first: u32, count: u32, status: MbStatus) {
        let first = first as usize;
        let end = (first + count as usize).min(self.mb_count);
        for mb in self.mb_status_scratch[first.min(self.mb_count)..end].iter_mut() {
            *mb = status as u8;
        }
    }

    /// Patch a gap in front of a received slice: synthesize a skipped-P
    /// slice when permitted, otherwise mark the range missing.
    fn patch_gap(
        &mut self,
        first_mb: u32,
        missing: u32,
        next_slice: &SliceHeader,
        next_index: usize,
        inserts: &mut Vec<(usize, Vec<u8>, SliceType)>,
    ) {
        if self.cfg.generate_skipped_p_slices && next_slice.slice_type == SliceType::P {
            if let Some(ctx) = self.writer_ctx_for(next_slice) {
                match write_skipped_p_slice(&ctx, first_mb, missing) {
                    Ok(nalu) => {
                        inserts.push((next_index, nalu, SliceType::P));
                        self.mark_mb_range(first_mb, missing, MbStatus::MissingConcealed);
                        return;
                    }
                    Err(e) => tracing::debug!("skipped-P synthesis failed: {e}"),
                }
            }
        }
        self.mark_mb_range(first_mb, missing, MbStatus::Missing);
    }

    /// Patch a truncated frame tail, appending after the last NALU.
    fn patch_end_gap(
        &mut self,
        first_mb: u32,
        missing: u32,
        prev_slice: &SliceHeader,
        inserts: &mut Vec<(usize, Vec<u8>, SliceType)>,
    ) {
        if self.cfg.generate_skipped_p_slices && prev_slice.slice_type == SliceType::P {
            if let Some(ctx) = self.writer_ctx_for(prev_slice) {
                match write_skipped_p_slice(&ctx, first_mb, missing) {
                    Ok(nalu) => {
                        inserts.push((usize::MAX, nalu, SliceType::P));
                        self.mark_mb_range(first_mb, missing, MbStatus::MissingConcealed);
                        return;
                    }
                    Err(e) => tracing::debug!("skipped-P synthesis failed: {e}"),
                }
            }
        }
        self.mark_mb_range(first_mb, missing, MbStatus::Missing);
    }

    fn writer_ctx_for(&self, slice: &SliceHeader) -> Option<SliceWriteContext> {
        let sps = self.sps_info.as_ref()?;
        let pps = self.pps_info.as_ref()?;
        Some(SliceWriteContext::from_stream(sps, pps, slice))
    }

    /// Synthesize a gray IDR access unit stamped one tick before `next`.
    fn build_gray_idr(&mut self, next: &AuAssembly, pool: &mut AuBufferPool) -> Result<AccessUnit> {
        let mut ctx = self
            .writer_ctx
            .clone()
            .ok_or_else(|| Error::InvalidState("no slice context for gray IDR".into()))?;
        ctx.frame_num = 0;
        ctx.idr_pic_id = 0;
        ctx.pic_order_cnt_lsb = 0;
        ctx.nal_ref_idc = 3;
        let slice = write_gray_idr_slice(&ctx, self.mb_count as u32)?;

        let buf = pool.acquire()?;
        let mut asm = AuAssembly::new(buf);
        asm.ntp_time_us = next.ntp_time_us.saturating_sub(1000);
        asm.ntp_time_raw_us = next.ntp_time_raw_us.saturating_sub(1000);
        asm.ntp_time_local_us = next.ntp_time_local_us.saturating_sub(1000);
        asm.ext_rtp_ts = next.ext_rtp_ts.saturating_sub(90);
        asm.rtp_ts = next.rtp_ts.wrapping_sub(90);
        asm.ended_on_marker = true;

        if !self.cfg.filter_out_sps_pps {
            let (sps, pps) = (
                self.sps.clone().ok_or(Error::WaitingForSync)?,
                self.pps.clone().ok_or(Error::WaitingForSync)?,
            );
            for (bytes, ty) in [(sps, NaluType::Sps), (pps, NaluType::Pps)] {
                let offset = asm.data_len();
                asm.append(&START_CODE);
                asm.append(&bytes);
                asm.push_nalu(NaluInfo {
                    offset,
                    len: asm.data_len() - offset,
                    nalu_type: ty,
                    slice_type: SliceType::Unknown,
                    missing_packets_before: 0,
                    is_last_in_au: false,
                });
            }
        }
        let offset = asm.data_len();
        asm.append(&START_CODE);
        asm.append(&slice);
        asm.push_nalu(NaluInfo {
            offset,
            len: asm.data_len() - offset,
            nalu_type: NaluType::SliceIdr,
            slice_type: SliceType::I,
            missing_packets_before: 0,
            is_last_in_au: false,
        });

        let buf = asm.buffer_mut();
        buf.mb_status.clear();
        buf.mb_status
            .resize(self.mb_count, MbStatus::ValidISlice as u8);

        tracing::info!("inserted gray IDR frame ({} macroblocks)", self.mb_count);
        Ok(asm.seal(AuSyncType::Idr, true, true))
    }

    /// Copy the surviving NAL units into a consumer buffer and deliver.
    fn emit_to_consumer(&mut self, au: &AccessUnit) {
        let cfg = self.cfg;
        let keep = move |info: &NaluInfo| match info.nalu_type {
            NaluType::Sps | NaluType::Pps => !cfg.filter_out_sps_pps,
            NaluType::Sei => !cfg.filter_out_sei,
            _ => true,
        };
        let size_hint: usize = au.nalus.iter().filter(|n| keep(n)).map(|n| n.len).sum();
        if size_hint == 0 {
            return;
        }
        let Some(mut buffer) = self.consumer.get_au_buffer(size_hint) else {
            tracing::warn!("consumer refused AU buffer of {size_hint} bytes");
            return;
        };
        if buffer.len() < size_hint {
            buffer.resize(size_hint, 0);
        }

        let mut len = 0usize;
        for info in au.nalus.iter().filter(|n| keep(n)) {
            let bytes = au.nalu_bytes(info);
            buffer[len..len + bytes.len()].copy_from_slice(bytes);
            if self.cfg.replace_start_codes_with_nalu_size && bytes.len() >= 4 {
                let nalu_len = (bytes.len() - 4) as u32;
                buffer[len..len + 4].copy_from_slice(&nalu_len.to_be_bytes());
            }
            len += bytes.len();
        }

        self.output_index += 1;
        match self.consumer.au_ready(buffer, len, au) {
            AuReadyStatus::Ok => {}
            AuReadyStatus::ResyncRequired => {
                tracing::info!("consumer requested resync, scheduling gray IDR");
                self.gray_idr_pending = true;
            }
        }
        self.stats.output_frame_count += 1;
        if au.has_errors {
            self.stats.errored_output_frame_count += 1;
        }
    }

    /// Fold one sealed AU into the running statistics.
    fn account_stats(&mut self, au: &AccessUnit) {
        let now_us = au.ntp_time_local_us;
        self.stats.timestamp_us = now_us;
        if au.buffer.mb_status.is_empty() || self.mb_count == 0 {
            return;
        }
        let mut zone_errored = [false; super::MB_STATUS_ZONE_COUNT];
        for (mb, &status) in au.buffer.mb_status.iter().enumerate() {
            let zone = mb_zone(mb, self.mb_width, self.mb_height);
            let class = (status as usize).min(super::MB_STATUS_CLASS_COUNT - 1);
            self.stats.macroblock_status[class][zone] += 1;
            if matches!(
                MbStatus::from_u8(status),
                MbStatus::Missing | MbStatus::Error
            ) {
                zone_errored[zone] = true;
            }
        }
        if zone_errored.iter().any(|&z| z) {
            if self.errored_second_start_us == 0
                || now_us.saturating_sub(self.errored_second_start_us) >= 1_000_000
            {
                self.errored_second_start_us = now_us;
                self.stats.errored_second_count += 1;
            }
            for (zone, errored) in zone_errored.iter().enumerate() {
                if *errored {
                    let start = &mut self.errored_second_start_by_zone_us[zone];
                    if *start == 0 || now_us.saturating_sub(*start) >= 1_000_000 {
                        *start = now_us;
                        self.stats.errored_second_count_by_zone[zone] += 1;
                    }
                }
            }
        }
    }
}

fn strip_start_code(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= 4 && bytes[..4] == START_CODE {
        &bytes[4..]
    } else {
        bytes
    }
}
