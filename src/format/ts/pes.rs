use super::parser::TsPacket;
use super::types::{pts_to_time, time_to_pts, PTS_MASK};
use crate::codec::StreamHandler;
use crate::error::{Result, TsError};
use bytes::{BufMut, BytesMut};
use log::trace;
use std::time::Duration;

/// Fixed part of every PES header: start code, stream id, packet length.
pub const PES_FIXED_HEADER_SIZE: usize = 6;

/// Fixed part plus the two flag bytes and `PES_header_data_length`.
pub const PES_OPTIONAL_HEADER_SIZE: usize = 9;

/// Streams whose PES packets carry no optional header
/// (ISO/IEC 13818-1 table 2-21).
fn has_optional_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        0xBC // program_stream_map
            | 0xBE // padding_stream
            | 0xBF // private_stream_2
            | 0xF0 // ECM
            | 0xF1 // EMM
            | 0xF2 // DSMCC
            | 0xF8 // H.222.1 type E
            | 0xFF // program_stream_directory
    )
}

/// Packetized Elementary Stream (PES) header structure
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PesHeader {
    /// Stream identifier indicating content type (video/audio/etc.)
    pub stream_id: u8,
    /// Bytes following the length field; 0 means unbounded.
    pub packet_length: u16,
    pub data_alignment: bool,
    /// Presentation Time Stamp (33 bits)
    pub pts: Option<u64>,
    /// Decoding Time Stamp (33 bits)
    pub dts: Option<u64>,
    /// Total header size: payload starts at this offset.
    pub header_length: usize,
}

impl PesHeader {
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            ..Default::default()
        }
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(time_to_pts(pts) & PTS_MASK);
        self
    }

    pub fn with_dts(mut self, dts: Duration) -> Self {
        self.dts = Some(time_to_pts(dts) & PTS_MASK);
        self
    }

    pub fn with_packet_length(mut self, packet_length: u16) -> Self {
        self.packet_length = packet_length;
        self
    }

    /// Parses the header at the start of `data`.
    ///
    /// Returns `Ok(None)` while more bytes are needed to see the whole
    /// header, and an error when the bytes cannot be a PES header.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < PES_FIXED_HEADER_SIZE {
            return Ok(None);
        }
        if data[..3] != [0x00, 0x00, 0x01] {
            return Err(TsError::InvalidData("missing PES start code".into()));
        }

        let stream_id = data[3];
        let packet_length = ((data[4] as u16) << 8) | data[5] as u16;
        let mut header = PesHeader {
            stream_id,
            packet_length,
            header_length: PES_FIXED_HEADER_SIZE,
            ..Default::default()
        };
        if !has_optional_header(stream_id) {
            return Ok(Some(header));
        }

        if data.len() < PES_OPTIONAL_HEADER_SIZE {
            return Ok(None);
        }
        if (data[6] & 0xC0) != 0x80 {
            return Err(TsError::InvalidData("PES optional header marker bits missing".into()));
        }
        header.data_alignment = (data[6] & 0x04) != 0;
        let pts_dts_flags = data[7] >> 6;
        let header_data_length = data[8] as usize;
        header.header_length = PES_OPTIONAL_HEADER_SIZE + header_data_length;
        if data.len() < header.header_length {
            return Ok(None);
        }
        if packet_length != 0 && header.header_length > PES_FIXED_HEADER_SIZE + packet_length as usize {
            return Err(TsError::InvalidData("PES header longer than packet".into()));
        }

        let fields = &data[PES_OPTIONAL_HEADER_SIZE..header.header_length];
        match pts_dts_flags {
            0b10 => {
                header.pts = Some(read_timestamp(fields, 0)?);
            }
            0b11 => {
                header.pts = Some(read_timestamp(fields, 0)?);
                header.dts = Some(read_timestamp(fields, 5)?);
            }
            0b01 => return Err(TsError::InvalidData("forbidden PTS_DTS_flags value".into())),
            _ => {}
        }
        Ok(Some(header))
    }

    /// Writes the header with `PES_header_data_length` sized for the
    /// timestamps present.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&[0x00, 0x00, 0x01]);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length);
        if !has_optional_header(self.stream_id) {
            return;
        }

        let mut flags = 0x80u8;
        if self.data_alignment {
            flags |= 0x04;
        }
        buf.put_u8(flags);

        let (pts_dts_flags, header_data_length) = match (self.pts, self.dts) {
            (Some(_), Some(_)) => (0xC0, 10),
            (Some(_), None) => (0x80, 5),
            _ => (0x00, 0),
        };
        buf.put_u8(pts_dts_flags);
        buf.put_u8(header_data_length);

        if let Some(pts) = self.pts {
            let marker = if self.dts.is_some() { 0x30 } else { 0x20 };
            write_timestamp(buf, marker, pts);
            if let Some(dts) = self.dts {
                write_timestamp(buf, 0x10, dts);
            }
        }
    }
}

fn read_timestamp(fields: &[u8], offset: usize) -> Result<u64> {
    let Some(b) = fields.get(offset..offset + 5) else {
        return Err(TsError::InvalidData("PES timestamp truncated".into()));
    };
    Ok((((b[0] as u64) & 0x0E) << 29)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64) & 0xFE) << 14)
        | ((b[3] as u64) << 7)
        | (((b[4] as u64) & 0xFE) >> 1))
}

fn write_timestamp(buf: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & PTS_MASK;

    // First byte: marker bits and 3 MSB of timestamp
    buf.put_u8(marker | ((ts >> 29) & 0x0E) as u8 | 0x01);

    // Middle 15 bits and marker
    buf.put_u16((((ts >> 14) & 0xFFFE) | 0x01) as u16);

    // Final 15 bits and marker
    buf.put_u16((((ts << 1) & 0xFFFE) | 0x01) as u16);
}

const WRAP: u64 = 1 << 33;
const HALF_WRAP: u64 = 1 << 32;

/// Extends 33-bit PES timestamps into a monotonic 64-bit timeline.
///
/// A jump backwards by more than half the 33-bit range is taken as a wrap;
/// a late timestamp from just before a wrap maps back into the previous
/// epoch without moving the reference.
#[derive(Debug, Clone, Default)]
pub struct TimestampUnwrapper {
    last: Option<u64>,
    offset: u64,
}

impl TimestampUnwrapper {
    pub fn unwrap(&mut self, ts: u64) -> u64 {
        let mut extended = (ts & PTS_MASK) + self.offset;
        if let Some(last) = self.last {
            if extended + HALF_WRAP < last {
                self.offset += WRAP;
                extended += WRAP;
            } else if extended > last + HALF_WRAP && self.offset >= WRAP {
                return extended - WRAP;
            }
        }
        self.last = Some(extended);
        extended
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.offset = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    /// Waiting for `payload_unit_start_indicator`.
    Idle,
    /// Collecting header bytes.
    Header,
    /// Forwarding payload; `remaining` is known only for bounded units.
    Payload { remaining: Option<usize> },
}

/// Reassembles PES units for one PID and streams their payload to a handler.
///
/// Payload bytes are forwarded as they arrive; unbounded units
/// (`PES_packet_length == 0`) end at the next unit start.
#[derive(Debug)]
pub struct PesReassembler {
    header: Vec<u8>,
    state: UnitState,
    pts: TimestampUnwrapper,
    dts: TimestampUnwrapper,
}

impl PesReassembler {
    pub fn new() -> Self {
        Self {
            header: Vec::with_capacity(PES_OPTIONAL_HEADER_SIZE + 10),
            state: UnitState::Idle,
            pts: TimestampUnwrapper::default(),
            dts: TimestampUnwrapper::default(),
        }
    }

    pub fn push(&mut self, packet: &TsPacket<'_>, handler: &mut StreamHandler) {
        if packet.payload_unit_start() {
            self.finish(handler);
            self.header.clear();
            self.state = UnitState::Header;
        } else if packet.continuity_error && self.state != UnitState::Idle {
            trace!("PES unit on PID 0x{:04x} lost data, dropping", packet.pid());
            self.abandon(handler);
            return;
        }

        let payload = packet.payload;
        match self.state {
            UnitState::Idle => {}
            UnitState::Header => self.push_header(payload, handler),
            UnitState::Payload { .. } => self.forward(payload, handler),
        }
    }

    fn push_header(&mut self, payload: &[u8], handler: &mut StreamHandler) {
        self.header.extend_from_slice(payload);
        let header = match PesHeader::parse(&self.header) {
            Ok(Some(header)) => header,
            Ok(None) => return,
            Err(e) => {
                trace!("dropping PES unit: {}", e);
                self.header.clear();
                self.state = UnitState::Idle;
                return;
            }
        };

        let pts = header.pts.map(|t| pts_to_time(self.pts.unwrap(t)));
        let dts = header.dts.map(|t| pts_to_time(self.dts.unwrap(t)));
        let remaining = match header.packet_length {
            0 => None,
            n => Some((PES_FIXED_HEADER_SIZE + n as usize).saturating_sub(header.header_length)),
        };

        handler.start_unit(pts, dts);
        self.state = UnitState::Payload { remaining };

        let buffered = std::mem::take(&mut self.header);
        self.forward(&buffered[header.header_length..], handler);
        self.header = buffered;
        self.header.clear();
    }

    fn forward(&mut self, data: &[u8], handler: &mut StreamHandler) {
        let UnitState::Payload { remaining } = self.state else {
            return;
        };
        match remaining {
            None => {
                if !data.is_empty() {
                    handler.data(data);
                }
            }
            Some(remaining) => {
                let take = remaining.min(data.len());
                if take > 0 {
                    handler.data(&data[..take]);
                }
                let left = remaining - take;
                self.state = UnitState::Payload { remaining: Some(left) };
                if left == 0 {
                    self.finish(handler);
                }
            }
        }
    }

    /// Ends the unit in progress, if its header was complete.
    fn finish(&mut self, handler: &mut StreamHandler) {
        if let UnitState::Payload { .. } = self.state {
            handler.end_unit();
        }
        self.state = UnitState::Idle;
    }

    fn abandon(&mut self, handler: &mut StreamHandler) {
        if let UnitState::Payload { .. } = self.state {
            handler.abort_unit();
        }
        self.header.clear();
        self.state = UnitState::Idle;
    }

    /// Finalizes any unit in progress (end of input).
    pub fn flush(&mut self, handler: &mut StreamHandler) {
        self.finish(handler);
        self.header.clear();
    }

    /// Drops partial state and timestamp history (seek).
    pub fn reset(&mut self, handler: &mut StreamHandler) {
        self.abandon(handler);
        self.pts.reset();
        self.dts.reset();
    }
}

impl Default for PesReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::RecordingSink;
    use crate::codec::{StreamHandler, StreamHandlerKind};
    use crate::config::DemuxerConfig;
    use crate::format::ts::writer::TsPacketizer;
    use crate::pool::PacketPool;
    use pretty_assertions::assert_eq;

    fn pes_unit(stream_id: u8, pts: Option<Duration>, bounded: bool, payload: &[u8]) -> Vec<u8> {
        let mut header = PesHeader::new(stream_id);
        if let Some(pts) = pts {
            header = header.with_pts(pts);
        }
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        if bounded {
            let length = (buf.len() - PES_FIXED_HEADER_SIZE + payload.len()) as u16;
            buf[4..6].copy_from_slice(&length.to_be_bytes());
        }
        buf.put_slice(payload);
        buf.to_vec()
    }

    fn passthrough() -> (StreamHandler, RecordingSink) {
        let sink = RecordingSink::default();
        let handler = StreamHandler::new(
            StreamHandlerKind::Passthrough,
            0x1b,
            PacketPool::default(),
            Box::new(sink.clone()),
            &DemuxerConfig::default(),
        );
        (handler, sink)
    }

    fn feed(reassembler: &mut PesReassembler, handler: &mut StreamHandler, packets: &[Vec<u8>]) {
        for raw in packets {
            let packet = TsPacket::parse(raw).unwrap();
            reassembler.push(&packet, handler);
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = PesHeader::new(0xC0)
            .with_pts(Duration::from_secs(1))
            .with_dts(Duration::from_millis(900));
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), 19);

        let parsed = PesHeader::parse(&buf).unwrap().unwrap();
        assert_eq!(parsed.pts, Some(90_000));
        assert_eq!(parsed.dts, Some(81_000));
        assert_eq!(parsed.header_length, 19);
        assert_eq!(PesHeader::parse(&buf[..12]).unwrap(), None);
        assert!(PesHeader::parse(&[0, 0, 2, 0xC0, 0, 0]).is_err());
    }

    #[test]
    fn test_stream_without_optional_header() {
        let parsed = PesHeader::parse(&[0, 0, 1, 0xBE, 0x00, 0x10]).unwrap().unwrap();
        assert_eq!(parsed.header_length, PES_FIXED_HEADER_SIZE);
        assert_eq!(parsed.pts, None);
    }

    #[test]
    fn test_timestamp_unwrap() {
        let mut unwrapper = TimestampUnwrapper::default();
        assert_eq!(unwrapper.unwrap(PTS_MASK - 100), PTS_MASK - 100);
        assert_eq!(unwrapper.unwrap(50), WRAP + 50);
        // Straggler from before the wrap
        assert_eq!(unwrapper.unwrap(PTS_MASK - 10), PTS_MASK - 10);
        assert_eq!(unwrapper.unwrap(200), WRAP + 200);
    }

    #[test]
    fn test_unbounded_units_end_at_next_start() {
        let (mut handler, sink) = passthrough();
        let mut reassembler = PesReassembler::new();
        let mut packetizer = TsPacketizer::new();

        let first: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let second = vec![7u8; 10];
        let mut packets = packetizer.pes_packets(0x100, &pes_unit(0xE0, Some(Duration::from_secs(2)), false, &first));
        packets.extend(packetizer.pes_packets(0x100, &pes_unit(0xE0, None, false, &second)));

        feed(&mut reassembler, &mut handler, &packets);
        assert_eq!(sink.packets().len(), 1);
        reassembler.flush(&mut handler);

        let packets = sink.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data, first);
        assert_eq!(packets[0].pts, Some(Duration::from_secs(2)));
        assert_eq!(packets[1].data, second);
        assert_eq!(packets[1].pts, None);
    }

    #[test]
    fn test_bounded_unit_finishes_early() {
        let (mut handler, sink) = passthrough();
        let mut reassembler = PesReassembler::new();
        let mut packetizer = TsPacketizer::new();

        let payload = vec![3u8; 300];
        let packets = packetizer.pes_packets(0x100, &pes_unit(0xC0, Some(Duration::from_millis(10)), true, &payload));
        feed(&mut reassembler, &mut handler, &packets);

        let packets = sink.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, payload);
    }

    #[test]
    fn test_data_before_first_start_is_ignored() {
        let (mut handler, sink) = passthrough();
        let mut reassembler = PesReassembler::new();
        let mut packetizer = TsPacketizer::new();

        let unit = pes_unit(0xC0, None, false, &[1u8; 400]);
        let packets = packetizer.pes_packets(0x100, &unit);
        // Join mid-unit: only the continuation packets arrive.
        feed(&mut reassembler, &mut handler, &packets[1..]);
        reassembler.flush(&mut handler);
        assert!(sink.packets().is_empty());
    }
}
