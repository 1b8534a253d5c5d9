use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use pwstream_common::config::{ConsumerMode, StreamProperties};
use pwstream_common::frame::FrameRecord;
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::signal::{lock, ReadinessSignal};
use crate::source::{FrameSink, FrameSource, StopToken};
use crate::store::FrameStore;

/// State shared between consumers and the capture thread.
pub(crate) struct Shared {
    pub(crate) props: StreamProperties,
    pub(crate) store: FrameStore,
    pub(crate) signal: ReadinessSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    /// Terminal. Reads and waits report `StreamError::Closed`.
    Closed,
}

/// Consumer-facing handle of one capture stream.
///
/// Cloning yields another handle to the same stream, so several consumer
/// threads can read from it. The stream closes on an explicit `close` or when
/// the last handle is dropped.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    shared: Arc<Shared>,
    stop: StopToken,
    capture: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    source_name: String,
}

impl Stream {
    /// Create the frame store and readiness signal, connect `source` and start
    /// the capture thread.
    ///
    /// Properties are normalised first; the stream keeps the normalised copy.
    /// On failure everything created so far is released before returning.
    pub fn init<S: FrameSource>(props: &StreamProperties, mut source: S) -> Result<Self, StreamError> {
        let props = props.normalized();

        let signal = ReadinessSignal::new(props.consumer_mode).map_err(|e| {
            error!(error = %e, stream = %props.stream_name, "failed to create readiness signal");
            StreamError::Signal(e)
        })?;
        let store = FrameStore::new(&props);

        let source_name = source.name().to_string();
        source.connect(&props).map_err(|e| {
            error!(error = %e, source = %source_name, "failed to connect frame source");
            StreamError::SourceUnavailable(e)
        })?;

        info!(
            stream = %props.stream_name,
            source = %source_name,
            mode = ?props.consumer_mode,
            media_type = %props.media_type,
            media_category = %props.media_category,
            media_role = %props.media_role,
            subtype = ?props.media_subtype_format,
            width = props.width,
            height = props.height,
            framerate = props.framerate,
            "starting stream"
        );

        let shared = Arc::new(Shared {
            props,
            store,
            signal,
        });
        let stop = StopToken::new();

        let capture = {
            let shared = Arc::clone(&shared);
            let stop = stop.clone();
            thread::Builder::new()
                .name("pws-capture".into())
                .spawn(move || capture_loop(source, shared, stop))
                .map_err(|e| {
                    error!(error = %e, "failed to spawn capture thread");
                    StreamError::Spawn(e)
                })?
        };

        Ok(Self {
            inner: Arc::new(StreamInner {
                shared,
                stop,
                capture: Mutex::new(Some(capture)),
                closed: AtomicBool::new(false),
                source_name,
            }),
        })
    }

    /// Copy the latest unread frame into `out`.
    ///
    /// Never blocks beyond the store's brief lock. `StreamError::FrameNotReady`
    /// means nothing new arrived since the previous successful read.
    pub fn read_frame(&self, out: &mut FrameRecord) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let shared = &self.inner.shared;
        shared.store.fetch(out, &shared.signal)
    }

    /// Block until a frame is signalled (blocking mode only).
    ///
    /// Each published frame grants one wake-up. A wake-up is a hint: another
    /// consumer may already have read the frame, so `read_frame` can still
    /// report `FrameNotReady` afterwards. Returns `StreamError::Closed` once
    /// the stream is closed, including for threads already blocked here.
    pub fn wait_for_frame(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        self.inner.shared.signal.wait()
    }

    /// Stop the capture thread and release the frame store and signal.
    ///
    /// Blocked waiters are woken first, then the source is stopped and the
    /// capture thread joined, and only then are the payload buffer and the
    /// pipe freed. Calling it again is a no-op.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Read end of the readiness pipe (edge mode, while streaming).
    ///
    /// The fd becomes readable when a frame is published. On close the write
    /// end is dropped, so a poller sees end-of-file.
    pub fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        if self.is_closed() {
            return None;
        }
        self.inner.shared.signal.fd()
    }

    /// Outstanding wake-ups: pipe bytes in edge mode, credits in blocking mode.
    pub fn pending_signals(&self) -> usize {
        self.inner.shared.signal.pending()
    }

    pub fn is_frame_ready(&self) -> bool {
        self.inner.shared.store.is_ready()
    }

    pub fn state(&self) -> StreamState {
        if self.is_closed() {
            StreamState::Closed
        } else {
            StreamState::Streaming
        }
    }

    pub fn properties(&self) -> &StreamProperties {
        &self.inner.shared.props
    }

    pub fn consumer_mode(&self) -> ConsumerMode {
        self.inner.shared.signal.mode()
    }

    pub fn source_name(&self) -> &str {
        &self.inner.source_name
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl StreamInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream = self.shared.props.stream_name.as_str();
        info!(stream, "closing stream");

        self.shared.signal.interrupt();
        self.stop.stop();

        if let Some(handle) = lock(&self.capture).take() {
            if handle.thread().id() == thread::current().id() {
                warn!(stream, "close called on the capture thread, not joining");
            } else if handle.join().is_err() {
                error!(stream, "capture thread panicked");
            }
        }

        self.shared.store.release();
        self.shared.signal.release();
        info!(stream, "stream closed");
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop<S: FrameSource>(mut source: S, shared: Arc<Shared>, stop: StopToken) {
    let mut sink = FrameSink::new(shared);
    info!(source = source.name(), "capture thread started");

    if let Err(e) = source.run(&mut sink, &stop) {
        error!(error = %e, source = source.name(), "frame source failed");
    }

    debug!(
        published = sink.published(),
        dropped = sink.dropped(),
        "capture thread finished"
    );
}
