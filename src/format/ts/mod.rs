//! # MPEG Transport Stream (TS) Demuxing
//!
//! This module splits an MPEG-2 transport stream into its elementary
//! streams:
//!
//! - 188-byte packet framing with resynchronization and continuity tracking
//! - Program Specific Information: PAT and PMT sections, CRC-checked and
//!   applied one complete version at a time
//! - PES reassembly with 33-bit PTS/DTS unwrapping
//! - A PID registry routing every elementary stream to its handler
//!
//! ## Example Usage
//!
//! ### Building and demuxing a stream
//!
//! ```rust
//! use tsdemux::codec::{PacketSink, StreamConfig};
//! use tsdemux::format::ts::{pat_section, pmt_section, PmtStreamSpec, TsDemuxer, TsPacketizer};
//! use tsdemux::format::ts::{PID_PAT, STREAM_TYPE_AC3};
//! use tsdemux::pool::PesPacket;
//!
//! struct Discard;
//!
//! impl PacketSink for Discard {
//!     fn configure(&mut self, _config: StreamConfig) {}
//!     fn submit(&mut self, _packet: PesPacket) {}
//!     fn end_of_stream(&mut self) {}
//! }
//!
//! # fn main() -> tsdemux::Result<()> {
//! let mut packetizer = TsPacketizer::new();
//! let mut input = Vec::new();
//! for packet in packetizer.section_packets(PID_PAT, &pat_section(1, 0, 0, 0, &[(1, 0x1000)])) {
//!     input.extend(packet);
//! }
//! let pmt = pmt_section(1, 0, 0x100, &[PmtStreamSpec::new(STREAM_TYPE_AC3, 0x100)]);
//! for packet in packetizer.section_packets(0x1000, &pmt) {
//!     input.extend(packet);
//! }
//!
//! let mut demuxer = TsDemuxer::builder()
//!     .sink_factory(|_stream| Some(Box::new(Discard) as Box<dyn PacketSink>))
//!     .build()?;
//! demuxer.process_data(&input);
//! assert_eq!(demuxer.stream_pids(), vec![0x100]);
//! # Ok(())
//! # }
//! ```

/// PID registry and session driver
pub mod demuxer;

/// Packet framing and continuity tracking
pub mod parser;

/// PES header parsing and unit reassembly
pub mod pes;

/// PAT/PMT section assembly and decoding
pub mod psi;

/// Core TS types and constants
pub mod types;

/// PAT/PMT and PES packetizing
pub mod writer;

pub use demuxer::{DemuxerStats, ProgramFilter, SinkFactory, StreamsHandler, TsDemuxer, TsDemuxerBuilder};
pub use parser::{TsPacket, TsPacketReader, TsReaderStats};
pub use pes::{PesHeader, PesReassembler, TimestampUnwrapper};
pub use psi::{
    PatDecoder, PatUpdate, PmtDecoder, ProgramEntry, ProgramStream, ProgramStreams, Section, SectionAssembler,
};
pub use types::{
    AdaptationField, StreamType, TsHeader, PID_NULL, PID_PAT, STREAM_TYPE_AAC, STREAM_TYPE_AC3, STREAM_TYPE_H264,
    STREAM_TYPE_H265, STREAM_TYPE_MPEG1_AUDIO, STREAM_TYPE_MPEG2_AUDIO, STREAM_TYPE_PRIVATE_PES, TS_PACKET_SIZE,
};
pub use writer::{pat_section, pmt_section, PmtStreamSpec, TsPacketizer};
