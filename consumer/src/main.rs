mod report;

use std::path::{Path, PathBuf};

use pwstream::{ConsumerMode, FrameRecord, Stream, StreamError};
use pwstream_common::config::{Config, ConfigError};
use pwstream_producer::{build_source, ProducerError};
use report::{FrameLog, FrameStats};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("source error: {0}")]
    Source(#[from] ProducerError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source = %config.source.kind,
        mode = ?config.stream.consumer_mode,
        max_frames = config.consumer.max_frames,
        "starting pwstream consumer"
    );

    match run(&config).await {
        Ok(stats) => info!(
            frames = stats.frames,
            bytes = stats.bytes,
            idr = stats.idr,
            i = stats.i,
            p = stats.p,
            invalid = stats.invalid,
            fps = ?stats.observed_fps(),
            "consumer finished"
        ),
        Err(e) => {
            error!(error = %e, "consumer failed");
            std::process::exit(1);
        }
    }
}

async fn run(config: &Config) -> Result<FrameStats, ConsumerError> {
    let source = build_source(&config.source)?;
    let stream = Stream::init(&config.stream, source)?;

    let log = FrameLog::new(
        config.consumer.output.as_deref().map(Path::new),
        config.consumer.max_frames,
    )?;

    let result = match stream.consumer_mode() {
        ConsumerMode::BlockingSemaphore => run_blocking(stream.clone(), log).await,
        _ => run_edge(&stream, log).await,
    };

    // Closing joins the capture thread.
    let closing = stream.clone();
    tokio::task::spawn_blocking(move || closing.close()).await?;

    result
}

/// Edge mode: wait for the readiness pipe in the reactor, then read.
async fn run_edge(stream: &Stream, mut log: FrameLog) -> Result<FrameStats, ConsumerError> {
    let fd = stream
        .readiness_fd()
        .ok_or(StreamError::Closed)?
        .try_clone_to_owned()?;
    let fd = AsyncFd::with_interest(fd, Interest::READABLE)?;

    let mut out = FrameRecord::default();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    while !log.is_done() {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            guard = fd.readable() => {
                let mut guard = guard?;
                match stream.read_frame(&mut out) {
                    Ok(()) => log.record(&out)?,
                    Err(StreamError::FrameNotReady) => debug!("woken without a new frame"),
                    Err(StreamError::Closed) => break,
                    Err(e) => return Err(e.into()),
                }
                guard.clear_ready();
            }
        }
    }

    Ok(log.finish()?)
}

/// Blocking mode: a blocking-pool thread waits on the semaphore. Ctrl-C
/// closes the stream, which wakes the waiter.
async fn run_blocking(stream: Stream, log: FrameLog) -> Result<FrameStats, ConsumerError> {
    let mut worker = {
        let stream = stream.clone();
        tokio::task::spawn_blocking(move || consume_blocking(&stream, log))
    };

    tokio::select! {
        result = &mut worker => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            tokio::task::spawn_blocking(move || stream.close()).await?;
            worker.await?
        }
    }
}

fn consume_blocking(stream: &Stream, mut log: FrameLog) -> Result<FrameStats, ConsumerError> {
    let mut out = FrameRecord::default();

    while !log.is_done() {
        match stream.wait_for_frame() {
            Ok(()) => {}
            Err(StreamError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
        match stream.read_frame(&mut out) {
            Ok(()) => log.record(&out)?,
            // Another reader took it, or a newer frame already replaced it.
            Err(StreamError::FrameNotReady) => debug!("woken without a new frame"),
            Err(StreamError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(log.finish()?)
}
