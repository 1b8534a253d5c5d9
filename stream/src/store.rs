use std::sync::Mutex;

use pwstream_common::config::{MarkerTable, MediaSubtypeFormat, StreamProperties};
use pwstream_common::frame::{classify, FrameRecord, PicType, StreamType};
use tracing::debug;

use crate::error::StreamError;
use crate::signal::{lock, ReadinessSignal};

/// Single-slot frame buffer shared by the capture thread and consumers.
///
/// The record and its ready flag live under one mutex, so a consumer sees
/// either the complete previous frame or the complete next one. A new frame
/// overwrites an unread one.
pub struct FrameStore {
    slot: Mutex<Slot>,
    stream_id: i16,
    stream_type: StreamType,
    subtype: MediaSubtypeFormat,
    table: MarkerTable,
    max_frame_bytes: usize,
}

struct Slot {
    record: FrameRecord,
    /// True iff a frame was written since the last successful fetch.
    ready: bool,
    closed: bool,
}

impl FrameStore {
    pub fn new(props: &StreamProperties) -> Self {
        Self {
            slot: Mutex::new(Slot {
                record: FrameRecord::default(),
                ready: false,
                closed: false,
            }),
            stream_id: props.stream_id,
            stream_type: StreamType::from(props.media_type_format),
            subtype: props.media_subtype_format,
            table: props.marker_table,
            max_frame_bytes: props.max_frame_bytes,
        }
    }

    /// Publish a frame. Only the capture thread calls this.
    ///
    /// If the payload buffer cannot hold the frame the previous record and
    /// the ready flag are left untouched and `StreamError::Allocation` is
    /// returned.
    pub fn update(
        &self,
        payload: &[u8],
        width: u32,
        height: u32,
        timestamp_ms: u64,
        signal: &ReadinessSignal,
    ) -> Result<PicType, StreamError> {
        let pic_type = classify(payload, self.subtype, self.table);

        let mut slot = lock(&self.slot);
        if slot.closed {
            return Err(StreamError::Closed);
        }

        copy_payload(&mut slot.record.payload, payload, self.max_frame_bytes)?;

        let record = &mut slot.record;
        record.stream_id = self.stream_id;
        record.stream_type = self.stream_type;
        record.pic_type = pic_type;
        record.width = width;
        record.height = height;
        record.size = payload.len() as u64;
        record.timestamp_ms = timestamp_ms;

        slot.ready = true;
        signal.notify();
        Ok(pic_type)
    }

    /// Copy the current frame into `out` and consume readiness.
    pub fn fetch(&self, out: &mut FrameRecord, signal: &ReadinessSignal) -> Result<(), StreamError> {
        let mut slot = lock(&self.slot);
        if slot.closed {
            return Err(StreamError::Closed);
        }
        if !slot.ready {
            return Err(StreamError::FrameNotReady);
        }

        let record = &slot.record;
        copy_payload(&mut out.payload, &record.payload, usize::MAX)?;
        out.stream_id = record.stream_id;
        out.stream_type = record.stream_type;
        out.pic_type = record.pic_type;
        out.width = record.width;
        out.height = record.height;
        out.size = record.size;
        out.timestamp_ms = record.timestamp_ms;

        slot.ready = false;
        signal.acknowledge();
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.slot).ready
    }

    /// Free the payload and refuse further updates and fetches.
    pub fn release(&self) {
        let mut slot = lock(&self.slot);
        let freed = slot.record.payload.capacity();
        slot.record = FrameRecord::default();
        slot.ready = false;
        slot.closed = true;
        debug!(freed, "released frame store");
    }
}

/// Replace the contents of `buf` with `src`.
///
/// Growth is reserved before the old bytes are discarded, so a failed
/// reservation leaves `buf` exactly as it was.
fn copy_payload(buf: &mut Vec<u8>, src: &[u8], limit: usize) -> Result<(), StreamError> {
    let requested = src.len();
    if requested > limit {
        return Err(StreamError::Allocation { requested, limit });
    }
    buf.try_reserve_exact(requested.saturating_sub(buf.len()))
        .map_err(|_| StreamError::Allocation { requested, limit })?;
    buf.clear();
    buf.extend_from_slice(src);
    Ok(())
}
