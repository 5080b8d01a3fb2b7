//! Synthesized H.264 bitstream: parameter sets for the test-pattern
//! sender, gray IDR slices to seed a decoder that lost its reference, and
//! skipped-P slices to patch missing macroblock ranges.
//!
//! The embedded writer is CAVLC-only. A gray IDR frame is a single
//! I-slice of Intra_16x16 macroblocks with DC prediction and no residual:
//! with no decoded neighbours the DC predictor is 128, which decodes to a
//! uniform mid-gray picture. A skipped-P slice is a P-slice whose entire
//! macroblock range is one `mb_skip_run`, so every macroblock repeats the
//! collocated reference block.

use super::bitstream::BitWriter;
use super::param::{PpsInfo, SliceHeader, SpsInfo};
use crate::error::{Error, Result};

/// Geometry and timing for a generated baseline SPS.
#[derive(Debug, Clone, Copy)]
pub struct SpsConfig {
    pub mb_width: u32,
    pub mb_height: u32,
    pub framerate_num: u32,
    pub framerate_den: u32,
}

/// Build a Baseline-profile SPS NAL unit (pic_order_cnt_type 2, VUI
/// timing info carrying the framerate).
pub fn write_sps(cfg: &SpsConfig) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(66, 8); // profile_idc: Baseline
    w.write_bits(0xC0, 8); // constraint_set0 + constraint_set1
    w.write_bits(40, 8); // level_idc 4.0
    w.write_ue(0); // seq_parameter_set_id
    w.write_ue(0); // log2_max_frame_num_minus4
    w.write_ue(2); // pic_order_cnt_type
    w.write_ue(1); // max_num_ref_frames
    w.write_bit(0); // gaps_in_frame_num_value_allowed_flag
    w.write_ue(cfg.mb_width - 1);
    w.write_ue(cfg.mb_height - 1);
    w.write_bit(1); // frame_mbs_only_flag
    w.write_bit(1); // direct_8x8_inference_flag
    w.write_bit(0); // frame_cropping_flag
    w.write_bit(1); // vui_parameters_present_flag
    w.write_bit(0); // aspect_ratio_info_present_flag
    w.write_bit(0); // overscan_info_present_flag
    w.write_bit(0); // video_signal_type_present_flag
    w.write_bit(0); // chroma_loc_info_present_flag
    w.write_bit(1); // timing_info_present_flag
    w.write_bits(cfg.framerate_den, 32); // num_units_in_tick
    w.write_bits(cfg.framerate_num * 2, 32); // time_scale
    w.write_bit(1); // fixed_frame_rate_flag
    w.write_bit(0); // nal_hrd_parameters_present_flag
    w.write_bit(0); // vcl_hrd_parameters_present_flag
    w.write_bit(0); // pic_struct_present_flag
    w.write_bit(0); // bitstream_restriction_flag
    w.write_trailing_bits();

    let mut nalu = vec![0x67]; // NRI=3, type 7
    nalu.extend_from_slice(&w.into_escaped());
    nalu
}

/// Build the matching PPS NAL unit (CAVLC, single slice group, no
/// per-slice deblocking control).
pub fn write_pps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(0); // pic_parameter_set_id
    w.write_ue(0); // seq_parameter_set_id
    w.write_bit(0); // entropy_coding_mode_flag: CAVLC
    w.write_bit(0); // bottom_field_pic_order_in_frame_present_flag
    w.write_ue(0); // num_slice_groups_minus1
    w.write_ue(0); // num_ref_idx_l0_default_active_minus1
    w.write_ue(0); // num_ref_idx_l1_default_active_minus1
    w.write_bit(0); // weighted_pred_flag
    w.write_bits(0, 2); // weighted_bipred_idc
    w.write_se(0); // pic_init_qp_minus26
    w.write_se(0); // pic_init_qs_minus26
    w.write_se(0); // chroma_qp_index_offset
    w.write_bit(0); // deblocking_filter_control_present_flag
    w.write_bit(0); // constrained_intra_pred_flag
    w.write_bit(0); // redundant_pic_cnt_present_flag
    w.write_trailing_bits();

    let mut nalu = vec![0x68]; // NRI=3, type 8
    nalu.extend_from_slice(&w.into_escaped());
    nalu
}

/// Everything the slice writer needs, inherited from the active parameter
/// sets and the most recently parsed slice header.
#[derive(Debug, Clone, Default)]
pub struct SliceWriteContext {
    pub pps_id: u32,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub nal_ref_idc: u8,

    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub entropy_coding_mode: bool,
    pub weighted_pred: bool,
    pub deblocking_filter_control_present: bool,
}

impl SliceWriteContext {
    pub fn from_stream(sps: &SpsInfo, pps: &PpsInfo, hdr: &SliceHeader) -> Self {
        Self {
            pps_id: pps.pps_id,
            frame_num: hdr.frame_num,
            idr_pic_id: hdr.idr_pic_id,
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            nal_ref_idc: hdr.nal_ref_idc,
            log2_max_frame_num: sps.log2_max_frame_num,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb: sps.log2_max_pic_order_cnt_lsb,
            entropy_coding_mode: pps.entropy_coding_mode,
            weighted_pred: pps.weighted_pred,
            deblocking_filter_control_present: pps.deblocking_filter_control_present,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.entropy_coding_mode {
            return Err(Error::Unsupported("CABAC slice synthesis".into()));
        }
        Ok(())
    }
}

/// Write a gray IDR slice NAL unit covering `mb_count` macroblocks.
///
/// The slice context is inherited from the stream but forced to IDR
/// values: `frame_num = 0`, `idr_pic_id = 0`, `nal_ref_idc = 3`.
pub fn write_gray_idr_slice(ctx: &SliceWriteContext, mb_count: u32) -> Result<Vec<u8>> {
    ctx.check_writable()?;
    if mb_count == 0 {
        return Err(Error::BadParameters("gray IDR needs at least one macroblock".into()));
    }

    let mut w = BitWriter::new();
    w.write_ue(0); // first_mb_in_slice
    w.write_ue(7); // slice_type: I (all slices)
    w.write_ue(ctx.pps_id);
    w.write_bits(0, ctx.log2_max_frame_num); // frame_num = 0
    w.write_ue(0); // idr_pic_id
    if ctx.pic_order_cnt_type == 0 {
        w.write_bits(0, ctx.log2_max_pic_order_cnt_lsb);
    }
    // dec_ref_pic_marking for an IDR picture
    w.write_bit(0); // no_output_of_prior_pics_flag
    w.write_bit(0); // long_term_reference_flag
    w.write_se(0); // slice_qp_delta
    if ctx.deblocking_filter_control_present {
        w.write_ue(0); // disable_deblocking_filter_idc
        w.write_se(0); // slice_alpha_c0_offset_div2
        w.write_se(0); // slice_beta_offset_div2
    }

    // One Intra_16x16 macroblock, DC prediction, CBP 0, per macroblock.
    // The luma DC level block is always present for Intra_16x16; with
    // every neighbour empty the CAVLC context nC is 0 and the empty
    // block codes as a single '1' bit.
    for _ in 0..mb_count {
        w.write_ue(3); // mb_type: I_16x16_2_0_0 (DC pred, cbp 0)
        w.write_ue(0); // intra_chroma_pred_mode: DC
        w.write_se(0); // mb_qp_delta
        w.write_bit(1); // luma DC coeff_token: TotalCoeff 0
    }
    w.write_trailing_bits();

    let mut nalu = vec![0x65]; // NRI=3, type 5 (IDR)
    nalu.extend_from_slice(&w.into_escaped());
    Ok(nalu)
}

/// Write a skipped-P slice NAL unit covering macroblocks
/// `[first_mb, first_mb + mb_count)`.
pub fn write_skipped_p_slice(
    ctx: &SliceWriteContext,
    first_mb: u32,
    mb_count: u32,
) -> Result<Vec<u8>> {
    ctx.check_writable()?;
    if ctx.weighted_pred {
        return Err(Error::Unsupported("weighted prediction in synthesized P slice".into()));
    }
    if mb_count == 0 {
        return Err(Error::BadParameters("skipped P slice needs at least one macroblock".into()));
    }

    let mut w = BitWriter::new();
    w.write_ue(first_mb);
    w.write_ue(5); // slice_type: P (all slices)
    w.write_ue(ctx.pps_id);
    w.write_bits(ctx.frame_num, ctx.log2_max_frame_num);
    if ctx.pic_order_cnt_type == 0 {
        w.write_bits(ctx.pic_order_cnt_lsb, ctx.log2_max_pic_order_cnt_lsb);
    }
    w.write_bit(0); // num_ref_idx_active_override_flag
    w.write_bit(0); // ref_pic_list_modification_flag_l0
    if ctx.nal_ref_idc != 0 {
        w.write_bit(0); // adaptive_ref_pic_marking_mode_flag
    }
    w.write_se(0); // slice_qp_delta
    if ctx.deblocking_filter_control_present {
        w.write_ue(0);
        w.write_se(0);
        w.write_se(0);
    }
    w.write_ue(mb_count); // mb_skip_run covering the whole slice
    w.write_trailing_bits();

    let header = ((ctx.nal_ref_idc & 0x3) << 5) | 0x01; // type 1
    let mut nalu = vec![header];
    nalu.extend_from_slice(&w.into_escaped());
    Ok(nalu)
}
