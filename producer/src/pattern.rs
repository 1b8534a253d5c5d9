use std::time::Duration;

use pwstream::{
    now_ms, FrameSink, FrameSource, NegotiatedFormat, SourceError, StopToken, StreamProperties,
};
use pwstream_common::config::{MarkerTable, MediaTypeFormat};
use tracing::info;

/// Synthetic H.264-shaped frames: one IDR followed by `gop - 1` P-frames,
/// repeating. Payloads carry the marker bytes of the stream's marker table,
/// so the classifier tags them as a real encoder's output would be tagged.
pub struct PatternSource {
    gop: u32,
    frame_bytes: usize,
    limit: Option<u64>,
    markers: Markers,
    format: Option<NegotiatedFormat>,
}

#[derive(Debug, Clone, Copy)]
struct Markers {
    idr: u8,
    p: u8,
}

impl PatternSource {
    pub fn new(gop: u32, frame_bytes: usize) -> Self {
        Self {
            gop: gop.max(1),
            frame_bytes: frame_bytes.max(8),
            limit: None,
            markers: Markers { idr: 0x27, p: 0x21 },
            format: None,
        }
    }

    /// Stop after `frames` frames instead of running until the stream closes.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Build frame number `seq`. IDR frames are four times the P-frame size.
    fn frame(&self, seq: u64) -> Vec<u8> {
        let keyframe = seq % self.gop as u64 == 0;
        let (marker, len) = if keyframe {
            (self.markers.idr, self.frame_bytes * 4)
        } else {
            (self.markers.p, self.frame_bytes)
        };
        let mut data = Vec::with_capacity(len);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, marker]);
        data.extend((0..len - 5).map(|i| (seq as usize + i) as u8));
        data
    }
}

impl FrameSource for PatternSource {
    fn connect(&mut self, props: &StreamProperties) -> Result<(), SourceError> {
        self.markers = match props.marker_table {
            // NAL headers 0x65 (IDR slice) and 0x41 (non-IDR slice)
            MarkerTable::AnnexB => Markers { idr: 0x65, p: 0x41 },
            _ => Markers { idr: 0x27, p: 0x21 },
        };
        self.format = Some(NegotiatedFormat {
            media_type: MediaTypeFormat::Video,
            subtype: props.media_subtype_format,
            width: props.width,
            height: props.height,
            framerate: props.framerate,
        });
        Ok(())
    }

    fn run(&mut self, sink: &mut FrameSink, stop: &StopToken) -> Result<(), SourceError> {
        if let Some(format) = self.format {
            sink.format_negotiated(format);
        }
        let interval = Duration::from_secs_f64(1.0 / sink.framerate().max(1) as f64);

        let mut seq = 0u64;
        while self.limit.map_or(true, |limit| seq < limit) {
            let data = self.frame(seq);
            sink.buffer_ready(&data, now_ms());
            seq += 1;
            if stop.sleep(interval) {
                break;
            }
        }

        info!(frames = seq, "pattern source finished");
        Ok(())
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pwstream::{ConsumerMode, FrameRecord, PicType, Stream, StreamError};

    #[test]
    fn gop_layout() {
        let source = PatternSource::new(3, 16);
        let idr = source.frame(0);
        assert_eq!(idr.len(), 64);
        assert_eq!(idr[4], 0x27);
        assert_eq!(source.frame(1)[4], 0x21);
        assert_eq!(source.frame(2).len(), 16);
        assert_eq!(source.frame(3)[4], 0x27);
    }

    #[test]
    fn tiny_sizes_are_clamped() {
        let source = PatternSource::new(0, 1);
        assert_eq!(source.frame(0).len(), 32);
        assert_eq!(source.frame(1)[4], 0x27);
    }

    fn collect(props: StreamProperties, frames: u64) -> Vec<FrameRecord> {
        let source = PatternSource::new(4, 32).with_limit(frames);
        let stream = Stream::init(&props, source).unwrap();
        let mut out = FrameRecord::default();
        let mut seen = Vec::new();
        for _ in 0..frames {
            stream.wait_for_frame().unwrap();
            match stream.read_frame(&mut out) {
                Ok(()) => seen.push(out.clone()),
                Err(StreamError::FrameNotReady) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        seen
    }

    #[test]
    fn classified_by_rpi_table() {
        let props = StreamProperties {
            consumer_mode: ConsumerMode::BlockingSemaphore,
            framerate: 200,
            width: 320,
            height: 240,
            ..Default::default()
        };
        let seen = collect(props, 8);
        assert!(!seen.is_empty());
        for record in &seen {
            assert_eq!((record.width, record.height), (320, 240));
            let expected = if record.payload.len() == 128 { PicType::Idr } else { PicType::P };
            assert_eq!(record.pic_type, expected);
        }
    }

    #[test]
    fn classified_by_annex_b_table() {
        let props = StreamProperties {
            consumer_mode: ConsumerMode::BlockingSemaphore,
            marker_table: MarkerTable::AnnexB,
            framerate: 200,
            ..Default::default()
        };
        for record in collect(props, 8) {
            assert_ne!(record.pic_type, PicType::Invalid);
            assert_eq!(record.payload[4] == 0x65, record.pic_type == PicType::Idr);
        }
    }
}
