use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use pwstream::{now_ms, FrameSink, FrameSource, SourceError, StopToken, StreamProperties};
use tracing::{debug, info, warn};

const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;
const READ_CHUNK: usize = 64 * 1024;

/// Replays H.264 access units from an MPEG-TS byte stream.
///
/// Each PES packet on the first video PID becomes one frame, published at the
/// stream's framerate. With `looped` the file restarts at end of stream.
pub struct TsReplaySource {
    path: Option<PathBuf>,
    reader: Option<Box<dyn Read + Send>>,
    looped: bool,
}

impl TsReplaySource {
    /// Replay a file; it is opened when the stream connects the source.
    pub fn from_path(path: impl Into<PathBuf>, looped: bool) -> Self {
        Self {
            path: Some(path.into()),
            reader: None,
            looped,
        }
    }

    /// Replay an in-memory or already-open stream once.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            path: None,
            reader: Some(Box::new(reader)),
            looped: false,
        }
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if let Some(path) = &self.path {
            let file = File::open(path).map_err(|e| {
                SourceError::Connect(format!("cannot open {}: {e}", path.display()))
            })?;
            self.reader = Some(Box::new(BufReader::new(file)));
        }
        Ok(())
    }
}

impl FrameSource for TsReplaySource {
    fn connect(&mut self, _props: &StreamProperties) -> Result<(), SourceError> {
        self.open()?;
        if self.reader.is_none() {
            return Err(SourceError::Connect("no transport stream input".into()));
        }
        info!(path = ?self.path, looped = self.looped, "opened transport stream");
        Ok(())
    }

    fn run(&mut self, sink: &mut FrameSink, stop: &StopToken) -> Result<(), SourceError> {
        let interval = Duration::from_secs_f64(1.0 / sink.framerate().max(1) as f64);
        let mut read_buf = vec![0u8; READ_CHUNK];
        let mut ts_buf = BytesMut::with_capacity(256 * 1024);
        let mut assembler = PesAssembler::new();
        let mut read_since_open = 0usize;

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(());
            };
            let n = reader.read(&mut read_buf)?;
            if n == 0 {
                if let Some(access_unit) = assembler.finish() {
                    sink.buffer_ready(&access_unit, now_ms());
                }
                if !self.looped || self.path.is_none() {
                    info!(published = sink.published(), "transport stream ended");
                    return Ok(());
                }
                if read_since_open == 0 {
                    return Err(SourceError::Backend(format!(
                        "{} is empty, nothing to replay",
                        self.path.as_deref().unwrap_or(Path::new("input")).display()
                    )));
                }
                if stop.sleep(interval) {
                    return Ok(());
                }
                debug!("transport stream ended, restarting");
                ts_buf.clear();
                assembler = PesAssembler::new();
                read_since_open = 0;
                self.open()?;
                continue;
            }

            read_since_open += n;
            ts_buf.extend_from_slice(&read_buf[..n]);

            while let Some(packet) = next_packet(&mut ts_buf) {
                if let Some(access_unit) = assembler.push_ts_packet(&packet) {
                    sink.buffer_ready(&access_unit, now_ms());
                    if stop.sleep(interval) {
                        return Ok(());
                    }
                }
            }

            if stop.is_stopped() {
                return Ok(());
            }
        }
    }

    fn name(&self) -> &str {
        "ts-replay"
    }
}

/// Pops the next aligned 188-byte packet, resynchronising on the sync byte.
fn next_packet(ts_buf: &mut BytesMut) -> Option<BytesMut> {
    while ts_buf.len() >= TS_PACKET_SIZE {
        let Some(sync_pos) = ts_buf.iter().position(|&b| b == TS_SYNC_BYTE) else {
            ts_buf.clear();
            return None;
        };
        if sync_pos > 0 {
            ts_buf.advance(sync_pos);
        }
        if ts_buf.len() < TS_PACKET_SIZE {
            return None;
        }
        // With two packets buffered, the next one must also start with a sync byte.
        if ts_buf.len() >= TS_PACKET_SIZE * 2 && ts_buf[TS_PACKET_SIZE] != TS_SYNC_BYTE {
            ts_buf.advance(1);
            continue;
        }
        return Some(ts_buf.split_to(TS_PACKET_SIZE));
    }
    None
}

/// Reassembles PES packets from MPEG-TS packets.
///
/// A new PES starts with a packet that has PUSI set; at that point the
/// previously accumulated access unit is complete.
struct PesAssembler {
    current_pes: Vec<u8>,
    /// PID of the video elementary stream, taken from the first video PES.
    video_pid: Option<u16>,
    collecting: bool,
}

impl PesAssembler {
    fn new() -> Self {
        Self {
            current_pes: Vec::with_capacity(128 * 1024),
            video_pid: None,
            collecting: false,
        }
    }

    fn push_ts_packet(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() < TS_PACKET_SIZE || packet[0] != TS_SYNC_BYTE {
            return None;
        }

        let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
        let pusi = (packet[1] & 0x40) != 0;
        let afc = (packet[3] >> 4) & 0x03;
        let has_payload = (afc & 0x01) != 0;

        // PAT and null packets
        if pid == 0x0000 || pid == 0x1FFF {
            return None;
        }

        let offset = payload_offset(packet, afc);
        if offset >= TS_PACKET_SIZE {
            return None;
        }
        let payload = &packet[offset..];

        if self.video_pid.is_none() && pusi && has_payload {
            // PES start code 00 00 01 followed by a video stream id 0xE0..=0xEF
            if payload.len() >= 4
                && payload[..3] == [0x00, 0x00, 0x01]
                && (0xE0..=0xEF).contains(&payload[3])
            {
                self.video_pid = Some(pid);
                info!(pid, stream_id = payload[3], "detected video PID");
            }
        }

        if self.video_pid != Some(pid) || !has_payload {
            return None;
        }

        let mut completed = None;

        if pusi {
            if self.collecting && !self.current_pes.is_empty() {
                completed = Some(std::mem::take(&mut self.current_pes));
            }
            // start code (3) + stream id (1) + length (2) + flags (2) + header length (1)
            if payload.len() >= 9 && payload[..3] == [0x00, 0x00, 0x01] {
                let es_start = 9 + payload[8] as usize;
                if es_start < payload.len() {
                    self.current_pes.extend_from_slice(&payload[es_start..]);
                }
                self.collecting = true;
            } else {
                warn!(pid, "PUSI packet without PES header, skipping");
                self.collecting = false;
            }
        } else if self.collecting {
            self.current_pes.extend_from_slice(payload);
        }

        completed
    }

    /// Emits the access unit still being collected at end of stream.
    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.collecting && !self.current_pes.is_empty() {
            self.collecting = false;
            return Some(std::mem::take(&mut self.current_pes));
        }
        None
    }
}

/// Byte offset of the TS payload, skipping the optional adaptation field.
fn payload_offset(packet: &[u8], afc: u8) -> usize {
    let has_adaptation = (afc & 0x02) != 0;
    if has_adaptation && packet.len() > 4 {
        5 + packet[4] as usize
    } else {
        4
    }
}
