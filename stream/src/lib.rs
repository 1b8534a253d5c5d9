//! Single-slot handoff of encoded frames from a capture thread to
//! synchronous consumers.
//!
//! A [`Stream`] owns one frame slot, a readiness signal and the capture
//! thread that runs a [`FrameSource`]. Every published frame overwrites the
//! slot. Consumers either poll the readiness pipe and call
//! [`Stream::read_frame`], or block in [`Stream::wait_for_frame`].

pub mod error;
pub mod signal;
pub mod source;
pub mod store;
pub mod stream;

pub use error::{SourceError, StreamError};
pub use source::{now_ms, FrameSink, FrameSource, NegotiatedFormat, PushHandle, PushSource, StopToken};
pub use stream::{Stream, StreamState};

pub use pwstream_common::config::{ConsumerMode, StreamProperties};
pub use pwstream_common::frame::{FrameRecord, PicType, StreamType};
