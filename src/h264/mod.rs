//! H.264 elementary stream vocabulary: NAL unit types, slice types,
//! access-unit classification and Annex-B framing helpers.

pub mod annexb;
pub mod bitstream;
pub mod conceal;
pub mod depayloader;
pub mod filter;
pub mod param;
pub mod payloader;
pub mod sei;

/// Annex-B start code prepended to every NAL unit on the output path.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// RTP payload structure types (RFC 6184).
pub const NALU_TYPE_STAP_A: u8 = 24;
pub const NALU_TYPE_FU_A: u8 = 28;

/// H.264 NAL unit types (bits 0-4 of the NAL header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Coded slice of a non-IDR picture (type 1).
    Slice,
    /// Data partitions (types 2..4); never produced by the encoders we
    /// interoperate with but classified for completeness.
    DataPartition,
    /// Coded slice of an IDR picture (type 5).
    SliceIdr,
    /// Supplemental enhancement information (type 6).
    Sei,
    /// Sequence parameter set (type 7).
    Sps,
    /// Picture parameter set (type 8).
    Pps,
    /// Access unit delimiter (type 9).
    Aud,
    /// Filler data (type 12).
    FillerData,
    Other(u8),
}

impl Default for NaluType {
    fn default() -> Self {
        NaluType::Other(0)
    }
}

impl NaluType {
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::Slice,
            2..=4 => Self::DataPartition,
            5 => Self::SliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            12 => Self::FillerData,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::DataPartition => 2,
            Self::SliceIdr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::Aud => 9,
            Self::FillerData => 12,
            Self::Other(v) => v,
        }
    }

    pub fn is_slice(self) -> bool {
        matches!(self, Self::Slice | Self::SliceIdr)
    }
}

/// Slice types as coded in the slice header (values 5..9 mean "all slices
/// in this picture share the type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
    #[default]
    Unknown,
}

impl SliceType {
    pub fn from_code(code: u32) -> Self {
        match code % 5 {
            0 => Self::P,
            1 => Self::B,
            2 => Self::I,
            3 => Self::Sp,
            4 => Self::Si,
            _ => Self::Unknown,
        }
    }
}

/// Synchronization value of an access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuSyncType {
    /// No sync point in this AU.
    #[default]
    None,
    /// The AU contains an IDR slice.
    Idr,
    /// Every slice in the AU is an I slice.
    IFrame,
    /// First AU of a periodic-intra-refresh GOP.
    PirStart,
}

/// Per-macroblock decode status maintained alongside each access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MbStatus {
    #[default]
    Unknown = 0,
    ValidISlice = 1,
    ValidPSlice = 2,
    Missing = 3,
    MissingConcealed = 4,
    Error = 5,
}

impl MbStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::ValidISlice,
            2 => Self::ValidPSlice,
            3 => Self::Missing,
            4 => Self::MissingConcealed,
            5 => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Number of macroblock status classes tracked in statistics.
pub const MB_STATUS_CLASS_COUNT: usize = 6;
/// Number of horizontal image bands used for per-zone statistics.
pub const MB_STATUS_ZONE_COUNT: usize = 5;

/// Zone index (horizontal band) of a macroblock row.
pub fn mb_zone(mb_index: usize, mb_width: usize, mb_height: usize) -> usize {
    if mb_width == 0 || mb_height == 0 {
        return 0;
    }
    let row = mb_index / mb_width;
    (row * MB_STATUS_ZONE_COUNT / mb_height).min(MB_STATUS_ZONE_COUNT - 1)
}
