use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use pwstream::{FrameRecord, PicType};
use tracing::{debug, info};

/// Running totals over the frames a consumer has read.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    pub bytes: u64,
    pub idr: u64,
    pub i: u64,
    pub p: u64,
    pub invalid: u64,
    pub first_ts: Option<u64>,
    pub last_ts: Option<u64>,
}

impl FrameStats {
    pub fn observe(&mut self, record: &FrameRecord) {
        self.frames += 1;
        self.bytes += record.size;
        match record.pic_type {
            PicType::Idr => self.idr += 1,
            PicType::I => self.i += 1,
            PicType::P => self.p += 1,
            PicType::Invalid => self.invalid += 1,
        }
        self.first_ts.get_or_insert(record.timestamp_ms);
        self.last_ts = Some(record.timestamp_ms);
    }

    /// Frames per second over the span between the first and last frame.
    pub fn observed_fps(&self) -> Option<f64> {
        let (first, last) = (self.first_ts?, self.last_ts?);
        if last <= first || self.frames < 2 {
            return None;
        }
        Some((self.frames - 1) as f64 * 1000.0 / (last - first) as f64)
    }
}

/// Consumes fetched frames: updates stats and optionally appends each payload
/// to an Annex B dump file.
pub struct FrameLog {
    stats: FrameStats,
    output: Option<BufWriter<File>>,
    max_frames: u64,
}

impl FrameLog {
    pub fn new(output: Option<&Path>, max_frames: u64) -> io::Result<Self> {
        let output = match output {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                info!(path = %path.display(), "writing frames to file");
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self {
            stats: FrameStats::default(),
            output,
            max_frames,
        })
    }

    pub fn record(&mut self, record: &FrameRecord) -> io::Result<()> {
        self.stats.observe(record);
        if let Some(output) = self.output.as_mut() {
            output.write_all(&record.payload)?;
        }

        debug!(
            seq = self.stats.frames,
            size = record.size,
            pic_type = record.pic_type.as_str(),
            width = record.width,
            height = record.height,
            ts = record.timestamp_ms,
            "frame read"
        );
        if self.stats.frames % 100 == 0 {
            info!(
                frames = self.stats.frames,
                bytes = self.stats.bytes,
                idr = self.stats.idr,
                "frames consumed"
            );
        }
        Ok(())
    }

    /// True once `max_frames` frames were read (never when unlimited).
    pub fn is_done(&self) -> bool {
        self.max_frames > 0 && self.stats.frames >= self.max_frames
    }

    pub fn finish(mut self) -> io::Result<FrameStats> {
        if let Some(output) = self.output.as_mut() {
            output.flush()?;
        }
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pic_type: PicType, size: u64, ts: u64) -> FrameRecord {
        FrameRecord {
            pic_type,
            size,
            payload: vec![0xAB; size as usize],
            timestamp_ms: ts,
            ..Default::default()
        }
    }

    #[test]
    fn stats_count_by_type() {
        let mut stats = FrameStats::default();
        stats.observe(&record(PicType::Idr, 400, 1_000));
        stats.observe(&record(PicType::P, 100, 1_040));
        stats.observe(&record(PicType::P, 100, 1_080));
        stats.observe(&record(PicType::Invalid, 10, 1_120));
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.bytes, 610);
        assert_eq!((stats.idr, stats.i, stats.p, stats.invalid), (1, 0, 2, 1));
        assert_eq!(stats.first_ts, Some(1_000));
        assert_eq!(stats.last_ts, Some(1_120));
        let fps = stats.observed_fps().unwrap();
        assert!((fps - 25.0).abs() < 1e-9);
    }

    #[test]
    fn fps_needs_two_distinct_timestamps() {
        let mut stats = FrameStats::default();
        assert!(stats.observed_fps().is_none());
        stats.observe(&record(PicType::P, 1, 5));
        assert!(stats.observed_fps().is_none());
        stats.observe(&record(PicType::P, 1, 5));
        assert!(stats.observed_fps().is_none());
    }

    #[test]
    fn frame_limit() {
        let mut log = FrameLog::new(None, 2).unwrap();
        log.record(&record(PicType::Idr, 4, 1)).unwrap();
        assert!(!log.is_done());
        log.record(&record(PicType::P, 4, 2)).unwrap();
        assert!(log.is_done());

        let mut unlimited = FrameLog::new(None, 0).unwrap();
        unlimited.record(&record(PicType::P, 4, 1)).unwrap();
        assert!(!unlimited.is_done());
    }

    #[test]
    fn payloads_appended_to_output() {
        let path = std::env::temp_dir().join(format!("pwstream-dump-{}.h264", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut log = FrameLog::new(Some(&path), 0).unwrap();
        log.record(&record(PicType::Idr, 3, 1)).unwrap();
        log.record(&record(PicType::P, 2, 2)).unwrap();
        let stats = log.finish().unwrap();
        assert_eq!(stats.frames, 2);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![0xAB; 5]);
        std::fs::remove_file(&path).unwrap();
    }
}
