//! Parameter-set and slice-header parsing.
//!
//! This is not a full H.264 parser: it reads exactly the fields the
//! stream core needs — picture geometry and framerate from the SPS,
//! entropy/deblocking layout from the PPS, and the leading slice-header
//! syntax elements that drive access-unit classification and slice
//! synthesis.

use super::bitstream::BitReader;
use super::{NaluType, SliceType};
use crate::error::{Error, Result};

/// Parsed sequence parameter set (subset).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub sps_id: u32,
    pub chroma_format_idc: u32,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub delta_pic_order_always_zero: bool,
    pub max_num_ref_frames: u32,
    pub mb_width: u32,
    pub mb_height: u32,
    pub frame_mbs_only: bool,
    /// Framerate from VUI timing info, if present.
    pub framerate: Option<f32>,
}

impl SpsInfo {
    pub fn mb_count(&self) -> u32 {
        self.mb_width * self.mb_height
    }
}

/// Parsed picture parameter set (subset).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PpsInfo {
    pub pps_id: u32,
    pub sps_id: u32,
    /// CABAC when true; the slice writer only supports CAVLC.
    pub entropy_coding_mode: bool,
    pub bottom_field_pic_order_in_frame_present: bool,
    pub num_ref_idx_l0_default_active: u32,
    pub num_ref_idx_l1_default_active: u32,
    pub weighted_pred: bool,
    pub weighted_bipred_idc: u32,
    pub pic_init_qp: i32,
    pub deblocking_filter_control_present: bool,
    pub redundant_pic_cnt_present: bool,
}

/// Slice-header fields needed for classification and synthesis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceHeader {
    pub nal_ref_idc: u8,
    pub nalu_type: NaluType,
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub slice_type_code: u32,
    pub pps_id: u32,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub slice_qp_delta: i32,
    pub disable_deblocking_filter_idc: u32,
}

/// Parse an SPS NAL unit (header byte included).
pub fn parse_sps(nalu: &[u8]) -> Result<SpsInfo> {
    if nalu.len() < 4 || NaluType::from_header(nalu[0]) != NaluType::Sps {
        return Err(Error::WireFormat("not an SPS NAL unit".into()));
    }
    let mut r = BitReader::new(&nalu[1..]);
    let mut sps = SpsInfo {
        profile_idc: r.read_bits(8)? as u8,
        ..Default::default()
    };
    r.read_bits(8)?; // constraint flags + reserved
    sps.level_idc = r.read_bits(8)? as u8;
    sps.sps_id = r.read_ue()?;

    sps.chroma_format_idc = 1;
    if matches!(
        sps.profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        sps.chroma_format_idc = r.read_ue()?;
        if sps.chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present: skip the scaling lists
            let count = if sps.chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    sps.log2_max_frame_num = r.read_ue()? + 4;
    sps.pic_order_cnt_type = r.read_ue()?;
    match sps.pic_order_cnt_type {
        0 => {
            sps.log2_max_pic_order_cnt_lsb = r.read_ue()? + 4;
        }
        1 => {
            sps.delta_pic_order_always_zero = r.read_bit()? == 1;
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }
    sps.max_num_ref_frames = r.read_ue()?;
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag
    sps.mb_width = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    sps.frame_mbs_only = r.read_bit()? == 1;
    sps.mb_height = if sps.frame_mbs_only {
        pic_height_in_map_units
    } else {
        r.read_bit()?; // mb_adaptive_frame_field_flag
        pic_height_in_map_units * 2
    };
    r.read_bit()?; // direct_8x8_inference_flag
    if r.read_bit()? == 1 {
        // frame cropping offsets
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? == 1 {
        sps.framerate = parse_vui_framerate(&mut r)?;
    }
    Ok(sps)
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: u32) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

fn parse_vui_framerate(r: &mut BitReader<'_>) -> Result<Option<f32>> {
    if r.read_bit()? == 1 {
        // aspect_ratio_info
        let idc = r.read_bits(8)?;
        if idc == 255 {
            r.read_bits(16)?;
            r.read_bits(16)?;
        }
    }
    if r.read_bit()? == 1 {
        r.read_bit()?; // overscan_appropriate_flag
    }
    if r.read_bit()? == 1 {
        // video_signal_type
        r.read_bits(3)?;
        r.read_bit()?;
        if r.read_bit()? == 1 {
            r.read_bits(8)?;
            r.read_bits(8)?;
            r.read_bits(8)?;
        }
    }
    if r.read_bit()? == 1 {
        // chroma_loc_info
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? == 1 {
        // timing_info
        let num_units_in_tick = r.read_bits(32)?;
        let time_scale = r.read_bits(32)?;
        if num_units_in_tick > 0 {
            // Two ticks per frame for frame-coded content.
            return Ok(Some(time_scale as f32 / (2.0 * num_units_in_tick as f32)));
        }
    }
    Ok(None)
}

/// Parse a PPS NAL unit (header byte included).
pub fn parse_pps(nalu: &[u8]) -> Result<PpsInfo> {
    if nalu.len() < 2 || NaluType::from_header(nalu[0]) != NaluType::Pps {
        return Err(Error::WireFormat("not a PPS NAL unit".into()));
    }
    let mut r = BitReader::new(&nalu[1..]);
    let mut pps = PpsInfo {
        pps_id: r.read_ue()?,
        sps_id: r.read_ue()?,
        entropy_coding_mode: r.read_bit()? == 1,
        bottom_field_pic_order_in_frame_present: r.read_bit()? == 1,
        ..Default::default()
    };
    let num_slice_groups = r.read_ue()? + 1;
    if num_slice_groups > 1 {
        return Err(Error::Unsupported("slice groups (FMO)".into()));
    }
    pps.num_ref_idx_l0_default_active = r.read_ue()? + 1;
    pps.num_ref_idx_l1_default_active = r.read_ue()? + 1;
    pps.weighted_pred = r.read_bit()? == 1;
    pps.weighted_bipred_idc = r.read_bits(2)?;
    pps.pic_init_qp = r.read_se()? + 26;
    r.read_se()?; // pic_init_qs_minus26
    r.read_se()?; // chroma_qp_index_offset
    pps.deblocking_filter_control_present = r.read_bit()? == 1;
    r.read_bit()?; // constrained_intra_pred_flag
    pps.redundant_pic_cnt_present = r.read_bit()? == 1;
    Ok(pps)
}

/// Parse the leading slice-header fields of a coded slice NAL unit.
pub fn parse_slice_header(nalu: &[u8], sps: &SpsInfo, pps: &PpsInfo) -> Result<SliceHeader> {
    if nalu.is_empty() {
        return Err(Error::WireFormat("empty slice NAL unit".into()));
    }
    let nalu_type = NaluType::from_header(nalu[0]);
    if !nalu_type.is_slice() {
        return Err(Error::WireFormat("not a slice NAL unit".into()));
    }
    let is_idr = nalu_type == NaluType::SliceIdr;
    let mut r = BitReader::new(&nalu[1..]);
    let mut hdr = SliceHeader {
        nal_ref_idc: (nalu[0] >> 5) & 0x3,
        nalu_type,
        first_mb_in_slice: r.read_ue()?,
        ..Default::default()
    };
    hdr.slice_type_code = r.read_ue()?;
    hdr.slice_type = SliceType::from_code(hdr.slice_type_code);
    hdr.pps_id = r.read_ue()?;
    hdr.frame_num = r.read_bits(sps.log2_max_frame_num)?;
    if !sps.frame_mbs_only {
        if r.read_bit()? == 1 {
            r.read_bit()?; // bottom_field_flag
        }
    }
    if is_idr {
        hdr.idr_pic_id = r.read_ue()?;
    }
    if sps.pic_order_cnt_type == 0 {
        hdr.pic_order_cnt_lsb = r.read_bits(sps.log2_max_pic_order_cnt_lsb)?;
        if pps.bottom_field_pic_order_in_frame_present {
            r.read_se()?; // delta_pic_order_cnt_bottom
        }
    } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero {
        r.read_se()?;
        if pps.bottom_field_pic_order_in_frame_present {
            r.read_se()?;
        }
    }
    if pps.redundant_pic_cnt_present {
        r.read_ue()?;
    }
    // Stop before the reference-picture machinery; everything the core
    // needs has been read.
    Ok(hdr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::bitstream::BitWriter;
    use crate::h264::conceal::{write_pps, write_sps, SpsConfig};

    #[test]
    fn test_parse_qcif_sps_roundtrip() {
        // 176x144 (11x9 MBs), the classic QCIF geometry.
        let cfg = SpsConfig {
            mb_width: 11,
            mb_height: 9,
            framerate_num: 30,
            framerate_den: 1,
        };
        let sps = write_sps(&cfg);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.mb_width, 11);
        assert_eq!(info.mb_height, 9);
        assert!(info.frame_mbs_only);
        assert_eq!(info.pic_order_cnt_type, 2);
        assert_eq!(info.mb_count(), 99);
    }

    #[test]
    fn test_parse_generated_sps_pps() {
        let cfg = SpsConfig {
            mb_width: 80,
            mb_height: 45, // 1280x720
            framerate_num: 30000,
            framerate_den: 1001,
        };
        let sps_nalu = write_sps(&cfg);
        let info = parse_sps(&sps_nalu).unwrap();
        assert_eq!(info.mb_width, 80);
        assert_eq!(info.mb_height, 45);
        assert_eq!(info.pic_order_cnt_type, 2);
        let fps = info.framerate.unwrap();
        assert!((fps - 29.97).abs() < 0.01, "fps={fps}");

        let pps_nalu = write_pps();
        let pps = parse_pps(&pps_nalu).unwrap();
        assert!(!pps.entropy_coding_mode);
        assert_eq!(pps.pps_id, 0);
        assert!(!pps.deblocking_filter_control_present);
    }

    #[test]
    fn test_parse_slice_header() {
        let sps = SpsInfo {
            log2_max_frame_num: 4,
            pic_order_cnt_type: 2,
            frame_mbs_only: true,
            mb_width: 11,
            mb_height: 9,
            ..Default::default()
        };
        let pps = PpsInfo::default();

        // Hand-build an IDR slice header: first_mb=0, slice_type=7 (I),
        // pps_id=0, frame_num=3, idr_pic_id=1, qp_delta=0.
        let mut w = BitWriter::new();
        w.write_ue(0); // first_mb_in_slice
        w.write_ue(7); // slice_type (I, all)
        w.write_ue(0); // pps_id
        w.write_bits(3, 4); // frame_num
        w.write_ue(1); // idr_pic_id
        w.write_se(0); // slice_qp_delta (not parsed, padding)
        w.write_trailing_bits();
        let mut nalu = vec![0x65];
        nalu.extend_from_slice(&w.into_escaped());

        let hdr = parse_slice_header(&nalu, &sps, &pps).unwrap();
        assert_eq!(hdr.nalu_type, NaluType::SliceIdr);
        assert_eq!(hdr.nal_ref_idc, 3);
        assert_eq!(hdr.first_mb_in_slice, 0);
        assert_eq!(hdr.slice_type, SliceType::I);
        assert_eq!(hdr.slice_type_code, 7);
        assert_eq!(hdr.frame_num, 3);
        assert_eq!(hdr.idr_pic_id, 1);
    }

    #[test]
    fn test_parse_sps_rejects_other_nalu() {
        assert!(parse_sps(&[0x65, 0x88, 0x80, 0x40]).is_err());
        assert!(parse_pps(&[0x67, 0x42]).is_err());
    }
}
