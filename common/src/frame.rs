use crate::config::{MarkerTable, MediaSubtypeFormat, MediaTypeFormat};

/// Coarse picture type guessed from the head of an encoded payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PicType {
    #[default]
    Invalid,
    Idr,
    I,
    P,
}

impl PicType {
    pub fn is_keyframe(self) -> bool {
        matches!(self, PicType::Idr | PicType::I)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PicType::Invalid => "invalid",
            PicType::Idr => "idr",
            PicType::I => "i",
            PicType::P => "p",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamType {
    #[default]
    Video,
    Audio,
}

impl From<MediaTypeFormat> for StreamType {
    fn from(format: MediaTypeFormat) -> Self {
        match format {
            MediaTypeFormat::Audio => StreamType::Audio,
            _ => StreamType::Video,
        }
    }
}

/// One encoded frame together with its capture metadata.
///
/// A stream keeps exactly one of these as its shared slot; consumers keep
/// their own and have it overwritten on every successful read. `size` always
/// equals `payload.len()` for records produced by a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameRecord {
    pub stream_id: i16,
    pub stream_type: StreamType,
    pub pic_type: PicType,
    pub payload: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub timestamp_ms: u64,
}

impl FrameRecord {
    pub fn is_keyframe(&self) -> bool {
        self.pic_type.is_keyframe()
    }
}

/// Offset of the marker byte in Raspberry Pi encoder output
/// (after the 4-byte start code).
pub const RPI_MARKER_OFFSET: usize = 4;

/// Guess the picture type of an encoded payload without decoding it.
///
/// Only H.264 payloads are classified; any other subtype, or a disabled
/// table, yields `PicType::Invalid`. Payloads too short for the table's
/// marker also yield `PicType::Invalid`.
pub fn classify(payload: &[u8], subtype: MediaSubtypeFormat, table: MarkerTable) -> PicType {
    if subtype != MediaSubtypeFormat::H264 {
        return PicType::Invalid;
    }
    match table {
        MarkerTable::Rpi => classify_rpi(payload),
        MarkerTable::AnnexB => classify_annex_b(payload),
        MarkerTable::Disabled | MarkerTable::Invalid => PicType::Invalid,
    }
}

fn classify_rpi(payload: &[u8]) -> PicType {
    match payload.get(RPI_MARKER_OFFSET) {
        Some(0x27) | Some(0x28) => PicType::Idr,
        Some(0x25) => PicType::I,
        Some(0x21) => PicType::P,
        _ => PicType::Invalid,
    }
}

fn classify_annex_b(payload: &[u8]) -> PicType {
    match first_vcl_nal_type(payload) {
        Some(5) => PicType::Idr,
        Some(1) => PicType::P,
        _ => PicType::Invalid,
    }
}

/// Scans Annex B start codes (0x000001 or 0x00000001) and returns the NAL
/// unit type of the first slice NAL (types 1..=5).
pub fn first_vcl_nal_type(data: &[u8]) -> Option<u8> {
    let mut i = 0;

    while i + 3 <= data.len() {
        let nal_offset = if data[i] == 0x00 && data[i + 1] == 0x00 {
            if data[i + 2] == 0x01 {
                Some(i + 3)
            } else if i + 3 < data.len() && data[i + 2] == 0x00 && data[i + 3] == 0x01 {
                Some(i + 4)
            } else {
                None
            }
        } else {
            None
        };

        match nal_offset {
            Some(offset) => {
                if let Some(header) = data.get(offset) {
                    let nal_type = header & 0x1F;
                    if (1..=5).contains(&nal_type) {
                        return Some(nal_type);
                    }
                }
                i = offset;
            }
            None => i += 1,
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpi(marker: u8) -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x01, marker, 0xAA, 0xBB]
    }

    fn classify_h264(data: &[u8], table: MarkerTable) -> PicType {
        classify(data, MediaSubtypeFormat::H264, table)
    }

    #[test]
    fn rpi_markers() {
        assert_eq!(classify_h264(&rpi(0x27), MarkerTable::Rpi), PicType::Idr);
        assert_eq!(classify_h264(&rpi(0x28), MarkerTable::Rpi), PicType::Idr);
        assert_eq!(classify_h264(&rpi(0x25), MarkerTable::Rpi), PicType::I);
        assert_eq!(classify_h264(&rpi(0x21), MarkerTable::Rpi), PicType::P);
    }

    #[test]
    fn rpi_unknown_marker_is_invalid() {
        for marker in [0x00, 0x01, 0x26, 0x41, 0x65, 0xFF] {
            assert_eq!(
                classify_h264(&rpi(marker), MarkerTable::Rpi),
                PicType::Invalid,
                "marker {marker:#04x}"
            );
        }
    }

    #[test]
    fn short_payload_is_invalid() {
        for len in 0..=RPI_MARKER_OFFSET {
            let data = vec![0x25; len];
            assert_eq!(classify_h264(&data, MarkerTable::Rpi), PicType::Invalid);
        }
        assert_eq!(classify_h264(&[], MarkerTable::AnnexB), PicType::Invalid);
    }

    #[test]
    fn disabled_table_always_invalid() {
        assert_eq!(classify_h264(&rpi(0x27), MarkerTable::Disabled), PicType::Invalid);
    }

    #[test]
    fn non_h264_subtype_always_invalid() {
        assert_eq!(
            classify(&rpi(0x27), MediaSubtypeFormat::Raw, MarkerTable::Rpi),
            PicType::Invalid
        );
    }

    #[test]
    fn annex_b_sps_then_idr() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, // SPS
            0x00, 0x00, 0x00, 0x01, 0x65, 0xAA, // IDR slice
        ];
        assert_eq!(classify_h264(&data, MarkerTable::AnnexB), PicType::Idr);
    }

    #[test]
    fn annex_b_non_idr_slice() {
        let data = [0x00, 0x00, 0x01, 0x41, 0xCC];
        assert_eq!(classify_h264(&data, MarkerTable::AnnexB), PicType::P);
    }

    #[test]
    fn annex_b_start_code_at_end() {
        assert_eq!(first_vcl_nal_type(&[0xAB, 0x00, 0x00, 0x01]), None);
        assert_eq!(first_vcl_nal_type(&[0x00, 0x00, 0x00, 0x01]), None);
    }

    #[test]
    fn keyframe_helpers() {
        assert!(PicType::Idr.is_keyframe());
        assert!(PicType::I.is_keyframe());
        assert!(!PicType::P.is_keyframe());
        assert!(!FrameRecord::default().is_keyframe());
    }

    #[test]
    fn stream_type_from_media_type() {
        assert_eq!(StreamType::from(MediaTypeFormat::Audio), StreamType::Audio);
        assert_eq!(StreamType::from(MediaTypeFormat::Video), StreamType::Video);
    }
}
