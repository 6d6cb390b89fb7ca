use super::{AudioConfig, PacketSink, StreamConfig};
use crate::error::Result;
use crate::pool::{PacketPool, PesPacket};
use log::{info, trace};
use std::time::Duration;

/// Format rules plugged into [`AudioFrameParser`].
///
/// Both supported formats open with a two-byte sync pattern.
pub trait FrameHeader: Sized {
    /// Bytes needed before [`FrameHeader::parse`] can run.
    const HEADER_LENGTH: usize;

    fn is_first_sync_byte(byte: u8) -> bool;

    fn is_second_sync_byte(first: u8, byte: u8) -> bool;

    /// Parses `HEADER_LENGTH` bytes starting with a sync pattern. Reserved
    /// or forbidden field values are errors.
    fn parse(header: &[u8]) -> Result<Self>;

    /// Whole frame size in bytes, header included.
    fn frame_length(&self) -> usize;

    fn duration(&self) -> Duration;

    fn config(&self) -> AudioConfig;
}

enum ParseState<H> {
    /// Scanning for the first sync byte.
    SearchSync,
    /// First sync byte stored at `start`; checking the next one.
    SyncSecond,
    /// Sync matched; collecting the rest of the header.
    Header,
    /// Header accepted; collecting the frame body.
    Body { header: H, pts: Duration },
}

/// Frame-sync state machine shared by the MP3 and AC-3 parsers.
///
/// Incoming bytes are scanned one at a time while looking for sync, and
/// copied in bulk while a frame body is collected. The working buffer is a
/// pooled packet; `start` marks the candidate frame and `index` the write
/// cursor (`start <= index <= capacity`). Each finished frame is copied into
/// a right-sized packet and handed to the sink.
pub struct AudioFrameParser<H: FrameHeader> {
    pool: PacketPool,
    sink: Box<dyn PacketSink>,
    buffer: Option<PesPacket>,
    start: usize,
    index: usize,
    state: ParseState<H>,
    position: Duration,
    pending_pts: Option<Duration>,
    configured: bool,
    frames: u64,
    rejected_headers: u64,
}

impl<H: FrameHeader> AudioFrameParser<H> {
    pub fn new(pool: PacketPool, sink: Box<dyn PacketSink>) -> Self {
        Self {
            pool,
            sink,
            buffer: None,
            start: 0,
            index: 0,
            state: ParseState::SearchSync,
            position: Duration::ZERO,
            pending_pts: None,
            configured: false,
            frames: 0,
            rejected_headers: 0,
        }
    }

    /// Seeds the running timestamp used for frames that arrive without a PTS.
    pub fn set_position(&mut self, position: Duration) {
        self.position = position;
    }

    pub fn position(&self) -> Duration {
        self.position
    }

    /// Timestamp for the next frame header accepted after this call.
    pub fn set_pending_timestamp(&mut self, pts: Option<Duration>) {
        if pts.is_some() {
            self.pending_pts = pts;
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn rejected_headers(&self) -> u64 {
        self.rejected_headers
    }

    pub fn process_data(&mut self, data: &[u8]) {
        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                ParseState::SearchSync => {
                    let Some(offset) = data[pos..].iter().position(|&b| H::is_first_sync_byte(b)) else {
                        return;
                    };
                    self.restart();
                    self.write(&data[pos + offset..pos + offset + 1]);
                    self.state = ParseState::SyncSecond;
                    pos += offset + 1;
                }
                ParseState::SyncSecond => {
                    let byte = data[pos];
                    pos += 1;
                    let first = self.working()[self.start];
                    if H::is_second_sync_byte(first, byte) {
                        self.write(&[byte]);
                        self.state = ParseState::Header;
                    } else if H::is_first_sync_byte(byte) {
                        // The breaking byte may open a sync pattern itself.
                        self.restart();
                        self.write(&[byte]);
                    } else {
                        self.state = ParseState::SearchSync;
                    }
                }
                ParseState::Header => {
                    let have = self.index - self.start;
                    let take = (H::HEADER_LENGTH - have).min(data.len() - pos);
                    self.write(&data[pos..pos + take]);
                    pos += take;
                    if self.index - self.start == H::HEADER_LENGTH {
                        self.accept_header();
                    }
                }
                ParseState::Body { ref header, .. } => {
                    let frame_length = header.frame_length();
                    let have = self.index - self.start;
                    let take = (frame_length - have).min(data.len() - pos);
                    self.write(&data[pos..pos + take]);
                    pos += take;
                    if self.index - self.start == frame_length {
                        self.emit_frame();
                    }
                }
            }
        }
    }

    fn accept_header(&mut self) {
        let parsed = H::parse(&self.working()[self.start..self.index]);
        let header = match parsed {
            Ok(header) => header,
            Err(e) => {
                self.rejected_headers += 1;
                trace!("rejecting frame header: {}", e);
                self.skip_invalid_header();
                return;
            }
        };

        if !self.configured {
            self.configured = true;
            let config = header.config();
            info!(
                "audio stream configured: {:?} {} Hz, {} channels, {} bps",
                config.codec, config.sample_rate, config.channels, config.bitrate
            );
            self.sink.configure(StreamConfig::Audio(config));
        }

        let pts = self.pending_pts.take().unwrap_or(self.position);
        let frame_length = header.frame_length();
        self.ensure_capacity(frame_length);
        self.state = ParseState::Body { header, pts };
        if frame_length <= H::HEADER_LENGTH {
            self.emit_frame();
        }
    }

    /// Slides one byte past a rejected header, keeping any later bytes of the
    /// header window that could open a sync pattern of this format.
    fn skip_invalid_header(&mut self) {
        let window = &self.working()[self.start + 1..self.index];
        let resume = (0..window.len()).find(|&i| {
            H::is_first_sync_byte(window[i]) && window.get(i + 1).map_or(true, |&b| H::is_second_sync_byte(window[i], b))
        });

        match resume {
            Some(i) => {
                self.start += 1 + i;
                trace!("resyncing {} bytes into rejected header", 1 + i);
                self.state = if self.index - self.start >= 2 {
                    ParseState::Header
                } else {
                    ParseState::SyncSecond
                };
                self.ensure_capacity(H::HEADER_LENGTH);
            }
            None => {
                self.state = ParseState::SearchSync;
                self.restart();
            }
        }
    }

    fn emit_frame(&mut self) {
        let ParseState::Body { header, pts } = std::mem::replace(&mut self.state, ParseState::SearchSync) else {
            return;
        };
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };

        let duration = header.duration();
        let mut packet = self.pool.copy(buffer, self.start, self.index - self.start);
        packet.pts = Some(pts);
        packet.dts = None;
        packet.duration = Some(duration);
        self.position = pts + duration;
        self.frames += 1;
        self.restart();
        self.sink.submit(packet);
    }

    /// Makes room for `frame_length` bytes from `start`, compacting first and
    /// moving to a larger pooled buffer only when compaction is not enough.
    fn ensure_capacity(&mut self, frame_length: usize) {
        let capacity = self.buffer.as_ref().map_or(0, |b| b.capacity());
        if self.start + frame_length <= capacity {
            return;
        }

        let held = self.index - self.start;
        if frame_length <= capacity {
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.buffer_mut().copy_within(self.start..self.index, 0);
            }
        } else {
            let mut larger = self.pool.allocate(frame_length);
            if let Some(old) = self.buffer.take() {
                larger.buffer_mut()[..held].copy_from_slice(&old.buffer()[self.start..self.index]);
                self.pool.free(old);
            }
            self.buffer = Some(larger);
        }
        self.start = 0;
        self.index = held;
    }

    fn restart(&mut self) {
        self.start = 0;
        self.index = 0;
        if self.buffer.is_none() {
            self.buffer = Some(self.pool.allocate(H::HEADER_LENGTH));
        }
    }

    fn working(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |b| b.buffer())
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.buffer_mut()[self.index..self.index + bytes.len()].copy_from_slice(bytes);
            self.index += bytes.len();
        }
    }

    /// Drops any partially collected frame and the pending timestamp.
    pub fn flush(&mut self) {
        self.state = ParseState::SearchSync;
        self.pending_pts = None;
        self.start = 0;
        self.index = 0;
    }

    /// End of input: an incomplete trailing frame is discarded and the
    /// working buffer goes back to the pool.
    pub fn end_of_stream(&mut self) {
        if let ParseState::Body { .. } | ParseState::Header = self.state {
            trace!("dropping incomplete trailing frame of {} bytes", self.index - self.start);
        }
        self.flush();
        if let Some(buffer) = self.buffer.take() {
            self.pool.free(buffer);
        }
        self.sink.end_of_stream();
    }
}

impl<H: FrameHeader> Drop for AudioFrameParser<H> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.free(buffer);
        }
    }
}
