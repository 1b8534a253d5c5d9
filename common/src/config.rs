use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamProperties,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Properties of one capture stream.
///
/// Every field is optional in the config file. Empty strings, zero numbers
/// and unrecognised enum spellings are left as-is by deserialization and
/// replaced by [`StreamProperties::normalized`] when the stream is created.
/// After that the properties are never modified.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamProperties {
    pub stream_name: String,
    pub media_type: String,
    pub media_category: String,
    pub media_role: String,
    pub media_type_format: MediaTypeFormat,
    pub media_subtype_format: MediaSubtypeFormat,
    pub video_format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub consumer_mode: ConsumerMode,
    pub marker_table: MarkerTable,
    pub stream_id: i16,
    /// Upper bound for a single payload; larger frames are dropped.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaTypeFormat {
    Video,
    Audio,
    #[default]
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaSubtypeFormat {
    Raw,
    H264,
    #[default]
    #[serde(other)]
    Invalid,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoFormat {
    Encoded,
    #[default]
    #[serde(other)]
    Invalid,
}

/// How consumers are woken when a new frame is published.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerMode {
    /// Non-blocking self-pipe; the read end can be handed to poll/epoll.
    EdgePipe,
    /// Counting semaphore; consumers block in `wait_for_frame`.
    BlockingSemaphore,
    #[default]
    #[serde(other)]
    Invalid,
}

/// Byte-pattern table used to guess the picture type of an H.264 payload.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarkerTable {
    /// Raspberry Pi encoder output: marker byte at offset 4.
    Rpi,
    /// Generic Annex B stream: first VCL NAL unit type.
    AnnexB,
    /// No table for this platform; every frame classifies as Invalid.
    Disabled,
    #[default]
    #[serde(other)]
    Invalid,
}

pub const DEFAULT_STREAM_NAME: &str = "FRAME_RENDER";
pub const DEFAULT_MEDIA_TYPE: &str = "Video";
pub const DEFAULT_MEDIA_CATEGORY: &str = "Capture";
pub const DEFAULT_MEDIA_ROLE: &str = "Camera";
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_FRAMERATE: u32 = 25;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

impl StreamProperties {
    /// Returns a copy with every unset or out-of-range field replaced by its default.
    pub fn normalized(&self) -> Self {
        let mut p = self.clone();

        fill_str(&mut p.stream_name, DEFAULT_STREAM_NAME);
        fill_str(&mut p.media_type, DEFAULT_MEDIA_TYPE);
        fill_str(&mut p.media_category, DEFAULT_MEDIA_CATEGORY);
        fill_str(&mut p.media_role, DEFAULT_MEDIA_ROLE);

        if p.media_type_format == MediaTypeFormat::Invalid {
            p.media_type_format = MediaTypeFormat::Video;
        }
        if p.media_subtype_format == MediaSubtypeFormat::Invalid {
            p.media_subtype_format = MediaSubtypeFormat::H264;
        }
        if p.video_format == VideoFormat::Invalid {
            p.video_format = VideoFormat::Encoded;
        }
        if p.consumer_mode == ConsumerMode::Invalid {
            p.consumer_mode = ConsumerMode::EdgePipe;
        }
        if p.marker_table == MarkerTable::Invalid {
            p.marker_table = MarkerTable::Rpi;
        }

        if p.width == 0 {
            p.width = DEFAULT_WIDTH;
        }
        if p.height == 0 {
            p.height = DEFAULT_HEIGHT;
        }
        if p.framerate == 0 {
            p.framerate = DEFAULT_FRAMERATE;
        }
        if p.max_frame_bytes == 0 {
            p.max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;
        }

        if p != *self {
            debug!(stream = %p.stream_name, "applied stream property defaults");
        }
        p
    }
}

fn fill_str(field: &mut String, default: &str) {
    if field.trim().is_empty() {
        *field = default.to_string();
    }
}

/// Which frame source the consumer binary drives the stream with.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// MPEG-TS file for the `ts` source.
    #[serde(default)]
    pub path: Option<String>,
    /// Restart the file from the beginning at end of stream.
    #[serde(default)]
    pub looped: bool,
    /// Frames per GOP for the `pattern` source.
    #[serde(default = "default_gop")]
    pub gop: u32,
    /// Payload size of synthetic P-frames.
    #[serde(default = "default_pattern_bytes")]
    pub frame_bytes: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            path: None,
            looped: false,
            gop: default_gop(),
            frame_bytes: default_pattern_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerConfig {
    /// Stop after this many frames; 0 runs until interrupted.
    #[serde(default)]
    pub max_frames: u64,
    /// Append every fetched payload to this file.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_source_kind() -> String {
    "pattern".into()
}
fn default_gop() -> u32 {
    25
}
fn default_pattern_bytes() -> usize {
    4096
}
fn default_log_level() -> String {
    "info".into()
}
