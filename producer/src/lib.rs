pub mod pattern;
pub mod ts;

use pwstream::FrameSource;
use pwstream_common::config::SourceConfig;

pub use pattern::PatternSource;
pub use ts::TsReplaySource;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("unknown source kind '{0}', expected 'pattern' or 'ts'")]
    UnknownKind(String),
    #[error("source kind 'ts' requires a path")]
    MissingPath,
}

/// Build the frame source described by the `[source]` config section.
pub fn build_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>, ProducerError> {
    match config.kind.as_str() {
        "pattern" => Ok(Box::new(PatternSource::new(config.gop, config.frame_bytes))),
        "ts" => {
            let path = config.path.as_ref().ok_or(ProducerError::MissingPath)?;
            Ok(Box::new(TsReplaySource::from_path(path, config.looped)))
        }
        other => Err(ProducerError::UnknownKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_configured_sources() {
        let pattern = build_source(&SourceConfig::default()).unwrap();
        assert_eq!(pattern.name(), "pattern");

        let ts = build_source(&SourceConfig {
            kind: "ts".into(),
            path: Some("/tmp/capture.ts".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ts.name(), "ts-replay");
    }

    #[test]
    fn rejects_bad_source_config() {
        let missing = SourceConfig {
            kind: "ts".into(),
            ..Default::default()
        };
        assert!(matches!(build_source(&missing), Err(ProducerError::MissingPath)));

        let unknown = SourceConfig {
            kind: "v4l2".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_source(&unknown),
            Err(ProducerError::UnknownKind(kind)) if kind == "v4l2"
        ));
    }
}
