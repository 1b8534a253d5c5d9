/// Result kinds surfaced by a stream to its consumers and to the capture path.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No frame has been published since the last successful read.
    #[error("no new frame is ready")]
    FrameNotReady,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("stream is closed")]
    Closed,
    /// The payload buffer could not grow to hold a frame; the frame was dropped.
    #[error("failed to allocate {requested} bytes for frame payload (limit {limit})")]
    Allocation { requested: usize, limit: usize },
    #[error("failed to create readiness signal: {0}")]
    Signal(std::io::Error),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
}

impl StreamError {
    /// Transient conditions the caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::FrameNotReady)
    }

    /// Errors that abort `Stream::init`.
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            StreamError::Signal(_) | StreamError::Spawn(_) | StreamError::SourceUnavailable(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to connect to capture backend: {0}")]
    Connect(String),
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_ready_is_retryable() {
        assert!(StreamError::FrameNotReady.is_retryable());
        assert!(!StreamError::Closed.is_retryable());
        assert!(!StreamError::InvalidArgument("x").is_retryable());
    }

    #[test]
    fn source_errors_are_init_failures() {
        let err: StreamError = SourceError::Connect("no daemon".into()).into();
        assert!(err.is_init_failure());
        assert!(err.to_string().contains("no daemon"));
        assert!(!StreamError::FrameNotReady.is_init_failure());
    }

    #[test]
    fn backend_error_message() {
        let err = SourceError::Backend("capture.ts is empty, nothing to replay".into());
        assert_eq!(
            err.to_string(),
            "capture backend error: capture.ts is empty, nothing to replay"
        );
    }
}
