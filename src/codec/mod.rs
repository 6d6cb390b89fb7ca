//! # Elementary Stream Handlers
//!
//! Everything between a reassembled PES payload and a [`PacketSink`]:
//! MP3 and AC-3 frame parsers built on one shared sync state machine, a
//! pass-through handler for every other stream type, and a Shoutcast (ICY)
//! metadata filter for raw audio streams.
//!
//! The handler set is closed: [`StreamHandler`] is an enum over the three
//! kinds, selected from the PMT `stream_type` by [`StreamHandlerKind`].

pub mod ac3;
pub mod frame;
pub mod mp3;
pub mod passthrough;
pub mod shoutcast;

pub use ac3::{Ac3Header, Ac3Parser};
pub use frame::{AudioFrameParser, FrameHeader};
pub use mp3::{Mp3Header, Mp3Parser};
pub use passthrough::PassthroughHandler;
pub use shoutcast::{AudioParser, MetadataSink, ShoutcastFilter, ShoutcastMetadata};

use crate::config::DemuxerConfig;
use crate::format::ts::types::{
    STREAM_TYPE_AC3, STREAM_TYPE_MPEG1_AUDIO, STREAM_TYPE_MPEG2_AUDIO, STREAM_TYPE_PRIVATE_PES,
};
use crate::pool::{PacketPool, PesPacket};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Mp3,
    Ac3,
}

/// Decoder setup reported once per audio stream, from its first valid frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
    /// Bits per second.
    pub bitrate: u32,
    pub frame_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamConfig {
    Audio(AudioConfig),
    /// A stream forwarded unparsed; only the PMT `stream_type` is known.
    Elementary { stream_type: u8 },
}

/// Downstream end of one elementary stream.
///
/// Implemented by [`crate::buffering::StreamBuffer`]; tests and tools plug
/// in their own.
pub trait PacketSink: Send {
    /// Called at most once, before the first packet.
    fn configure(&mut self, config: StreamConfig);

    /// Takes ownership of one finished packet.
    fn submit(&mut self, packet: PesPacket);

    fn end_of_stream(&mut self);
}

/// Which handler processes a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamHandlerKind {
    Mp3,
    Ac3,
    Passthrough,
}

impl StreamHandlerKind {
    pub fn for_stream_type(stream_type: u8, has_ac3_descriptor: bool) -> Self {
        match stream_type {
            STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => StreamHandlerKind::Mp3,
            STREAM_TYPE_AC3 => StreamHandlerKind::Ac3,
            STREAM_TYPE_PRIVATE_PES if has_ac3_descriptor => StreamHandlerKind::Ac3,
            _ => StreamHandlerKind::Passthrough,
        }
    }
}

/// Per-PID consumer of PES unit events.
pub enum StreamHandler {
    Mp3(Mp3Parser),
    Ac3(Ac3Parser),
    Passthrough(PassthroughHandler),
}

impl StreamHandler {
    pub fn new(
        kind: StreamHandlerKind,
        stream_type: u8,
        pool: PacketPool,
        sink: Box<dyn PacketSink>,
        config: &DemuxerConfig,
    ) -> Self {
        match kind {
            StreamHandlerKind::Mp3 => StreamHandler::Mp3(Mp3Parser::new(pool, sink)),
            StreamHandlerKind::Ac3 => StreamHandler::Ac3(Ac3Parser::new(pool, sink)),
            StreamHandlerKind::Passthrough => StreamHandler::Passthrough(PassthroughHandler::new(
                stream_type,
                pool,
                sink,
                config.max_pes_length,
            )),
        }
    }

    pub fn kind(&self) -> StreamHandlerKind {
        match self {
            StreamHandler::Mp3(_) => StreamHandlerKind::Mp3,
            StreamHandler::Ac3(_) => StreamHandlerKind::Ac3,
            StreamHandler::Passthrough(_) => StreamHandlerKind::Passthrough,
        }
    }

    /// A PES unit begins. Audio parsers stamp the next frame header with
    /// `pts`; the pass-through handler opens a new packet.
    pub fn start_unit(&mut self, pts: Option<Duration>, dts: Option<Duration>) {
        match self {
            StreamHandler::Mp3(p) => p.set_pending_timestamp(pts),
            StreamHandler::Ac3(p) => p.set_pending_timestamp(pts),
            StreamHandler::Passthrough(p) => p.start_unit(pts, dts),
        }
    }

    pub fn data(&mut self, data: &[u8]) {
        match self {
            StreamHandler::Mp3(p) => p.process_data(data),
            StreamHandler::Ac3(p) => p.process_data(data),
            StreamHandler::Passthrough(p) => p.data(data),
        }
    }

    /// The unit ended cleanly. Audio frames may straddle PES units, so only
    /// the pass-through handler acts on it.
    pub fn end_unit(&mut self) {
        if let StreamHandler::Passthrough(p) = self {
            p.end_unit();
        }
    }

    /// The unit lost data; whatever was partially collected is dropped.
    pub fn abort_unit(&mut self) {
        match self {
            StreamHandler::Mp3(p) => p.flush(),
            StreamHandler::Ac3(p) => p.flush(),
            StreamHandler::Passthrough(p) => p.abort_unit(),
        }
    }

    /// Drops partial state after a seek.
    pub fn flush(&mut self) {
        self.abort_unit();
    }

    pub fn end_of_stream(&mut self) {
        match self {
            StreamHandler::Mp3(p) => p.end_of_stream(),
            StreamHandler::Ac3(p) => p.end_of_stream(),
            StreamHandler::Passthrough(p) => p.end_of_stream(),
        }
    }
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StreamHandler").field(&self.kind()).finish()
    }
}
