use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use pwstream_common::config::{MediaSubtypeFormat, MediaTypeFormat, StreamProperties};
use pwstream_common::frame::PicType;
use tracing::{debug, info, warn};

use crate::error::{SourceError, StreamError};
use crate::signal::lock;
use crate::stream::Shared;

/// A capture backend driven on the stream's capture thread.
///
/// `connect` runs during `Stream::init` on the caller's thread; a failure
/// aborts initialisation. `run` then executes the backend's event loop on the
/// capture thread, reporting frames through the sink, and must return soon
/// after `stop` is raised.
pub trait FrameSource: Send + 'static {
    fn connect(&mut self, props: &StreamProperties) -> Result<(), SourceError>;

    fn run(&mut self, sink: &mut FrameSink, stop: &StopToken) -> Result<(), SourceError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

impl FrameSource for Box<dyn FrameSource> {
    fn connect(&mut self, props: &StreamProperties) -> Result<(), SourceError> {
        (**self).connect(props)
    }

    fn run(&mut self, sink: &mut FrameSink, stop: &StopToken) -> Result<(), SourceError> {
        (**self).run(sink, stop)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Format reported by the backend once negotiation with the device settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub media_type: MediaTypeFormat,
    pub subtype: MediaSubtypeFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

/// Callback surface handed to a [`FrameSource`].
///
/// Buffers passed to `buffer_ready` are only borrowed for the duration of the
/// call; the bytes are copied into the stream's frame store.
pub struct FrameSink {
    shared: Arc<Shared>,
    width: u32,
    height: u32,
    framerate: u32,
    published: u64,
    dropped: u64,
}

impl FrameSink {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let props = &shared.props;
        let (width, height, framerate) = (props.width, props.height, props.framerate);
        Self {
            shared,
            width,
            height,
            framerate,
            published: 0,
            dropped: 0,
        }
    }

    /// Record the negotiated size; later frames carry it.
    pub fn format_negotiated(&mut self, format: NegotiatedFormat) {
        if format.media_type != MediaTypeFormat::Video {
            debug!(media_type = ?format.media_type, "ignoring non-video format");
            return;
        }
        if format.width > 0 && format.height > 0 {
            self.width = format.width;
            self.height = format.height;
        }
        if format.framerate > 0 {
            self.framerate = format.framerate;
        }
        info!(
            stream = %self.shared.props.stream_name,
            subtype = ?format.subtype,
            width = self.width,
            height = self.height,
            framerate = self.framerate,
            "format negotiated"
        );
    }

    /// Publish one frame. A frame that cannot be stored is dropped and the
    /// previous frame stays available.
    pub fn buffer_ready(&mut self, data: &[u8], arrival_ms: u64) -> Option<PicType> {
        let shared = &self.shared;
        match shared
            .store
            .update(data, self.width, self.height, arrival_ms, &shared.signal)
        {
            Ok(pic_type) => {
                self.published += 1;
                debug!(
                    seq = self.published,
                    size = data.len(),
                    pic_type = pic_type.as_str(),
                    ts = arrival_ms,
                    "published frame"
                );
                Some(pic_type)
            }
            Err(StreamError::Closed) => {
                debug!(size = data.len(), "stream closed, frame discarded");
                None
            }
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, dropped = self.dropped, "dropping frame, keeping previous");
                None
            }
        }
    }

    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Cooperative stop request for the capture thread.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    shared: Arc<StopState>,
}

#[derive(Debug, Default)]
struct StopState {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = lock(&self.shared.stopped);
        *stopped = true;
        self.shared.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.shared.stopped)
    }

    /// Sleeps for `timeout` unless stopped first. Returns `true` if stopped.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let stopped = lock(&self.shared.stopped);
        let (stopped, _) = self
            .shared
            .condvar
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// Milliseconds since the Unix epoch, the timestamp base of frame records.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(20);

enum PushEvent {
    Format(NegotiatedFormat),
    Buffer { data: Vec<u8>, arrival_ms: u64 },
}

/// Source fed by the application through a [`PushHandle`].
///
/// Lets an embedding program bridge a backend this crate does not know about:
/// the backend's callbacks push into the handle, and the capture thread
/// forwards each event into the stream.
pub struct PushSource {
    rx: Receiver<PushEvent>,
}

/// Producer end of a [`PushSource`]. Cloneable; dropping every handle ends
/// the source's run loop.
#[derive(Clone)]
pub struct PushHandle {
    tx: SyncSender<PushEvent>,
}

impl PushSource {
    /// `depth` bounds how many events may wait for the capture thread.
    pub fn new(depth: usize) -> (Self, PushHandle) {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        (Self { rx }, PushHandle { tx })
    }
}

impl PushHandle {
    /// Push a frame stamped with the current time. Returns `false` once the
    /// source has gone away.
    pub fn push(&self, data: &[u8]) -> bool {
        self.push_at(data, now_ms())
    }

    pub fn push_at(&self, data: &[u8], arrival_ms: u64) -> bool {
        self.tx
            .send(PushEvent::Buffer {
                data: data.to_vec(),
                arrival_ms,
            })
            .is_ok()
    }

    pub fn negotiate(&self, format: NegotiatedFormat) -> bool {
        self.tx.send(PushEvent::Format(format)).is_ok()
    }
}

impl FrameSource for PushSource {
    fn connect(&mut self, _props: &StreamProperties) -> Result<(), SourceError> {
        Ok(())
    }

    fn run(&mut self, sink: &mut FrameSink, stop: &StopToken) -> Result<(), SourceError> {
        while !stop.is_stopped() {
            match self.rx.recv_timeout(PUSH_POLL_INTERVAL) {
                Ok(PushEvent::Format(format)) => sink.format_negotiated(format),
                Ok(PushEvent::Buffer { data, arrival_ms }) => {
                    sink.buffer_ready(&data, arrival_ms);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("all push handles dropped, source finished");
                    break;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "push"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn stop_token_interrupts_sleep() {
        let token = StopToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let stopped = token.sleep(Duration::from_secs(30));
                (stopped, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.stop();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
        assert!(token.is_stopped());
    }

    #[test]
    fn stop_token_sleep_times_out() {
        let token = StopToken::new();
        assert!(!token.sleep(Duration::from_millis(5)));
        assert!(!token.is_stopped());
    }

    #[test]
    fn push_handle_reports_gone_source() {
        let (source, handle) = PushSource::new(1);
        drop(source);
        assert!(!handle.push(&[1, 2, 3]));
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
