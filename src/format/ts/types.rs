use crate::error::{Result, TsError};
use bytes::{BufMut, BytesMut};
use std::time::Duration;

// PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_NULL: u16 = 0x1FFF;
pub const PID_MAX: u16 = 0x1FFF;

// Table IDs
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;

// Elementary stream types (ISO/IEC 13818-1 table 2-34, plus ATSC A/52)
pub const STREAM_TYPE_MPEG1_VIDEO: u8 = 0x01;
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_TYPE_PRIVATE_PES: u8 = 0x06;
pub const STREAM_TYPE_AAC: u8 = 0x0f;
pub const STREAM_TYPE_AAC_LATM: u8 = 0x11;
pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_H265: u8 = 0x24;
pub const STREAM_TYPE_AC3: u8 = 0x81;

// Descriptor tags
pub const DESCRIPTOR_REGISTRATION: u8 = 0x05;
pub const DESCRIPTOR_ISO_639_LANGUAGE: u8 = 0x0a;
pub const DESCRIPTOR_AC3: u8 = 0x6a;

// Constants
pub const SYNC_BYTE: u8 = 0x47;
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_HEADER_SIZE: usize = 4;
pub const TS_MAX_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
pub const PTS_HZ: u64 = 90_000;
pub const PCR_HZ: u64 = 27_000_000;

/// Timestamps carried in PES headers are 33 bits wide.
pub const PTS_MASK: u64 = (1 << 33) - 1;

/// Media class of an elementary stream, derived from its `stream_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Video,
    Audio,
    Other,
}

impl StreamType {
    /// Classifies a PMT `stream_type`. Private PES (0x06) only counts as
    /// audio when the caller has found an AC-3 descriptor for it.
    pub fn classify(stream_type: u8, has_ac3_descriptor: bool) -> Self {
        match stream_type {
            STREAM_TYPE_MPEG1_VIDEO | STREAM_TYPE_MPEG2_VIDEO | STREAM_TYPE_H264 | STREAM_TYPE_H265 => {
                StreamType::Video
            }
            STREAM_TYPE_MPEG1_AUDIO
            | STREAM_TYPE_MPEG2_AUDIO
            | STREAM_TYPE_AAC
            | STREAM_TYPE_AAC_LATM
            | STREAM_TYPE_AC3 => StreamType::Audio,
            STREAM_TYPE_PRIVATE_PES if has_ac3_descriptor => StreamType::Audio,
            _ => StreamType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub transport_priority: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_exists: bool,
    pub contains_payload: bool,
    pub continuity_counter: u8,
}

impl Default for TsHeader {
    fn default() -> Self {
        Self {
            transport_error: false,
            payload_unit_start: false,
            transport_priority: false,
            pid: 0,
            scrambling_control: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TsHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TS_HEADER_SIZE {
            return Err(TsError::InvalidData("TS packet too short".into()));
        }
        if data[0] != SYNC_BYTE {
            return Err(TsError::InvalidData(format!("invalid sync byte 0x{:02x}", data[0])));
        }

        Ok(TsHeader {
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            transport_priority: (data[1] & 0x20) != 0,
            pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            contains_payload: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(SYNC_BYTE);

        let mut b1 = 0u8;
        if self.transport_error {
            b1 |= 0x80;
        }
        if self.payload_unit_start {
            b1 |= 0x40;
        }
        if self.transport_priority {
            b1 |= 0x20;
        }
        b1 |= ((self.pid >> 8) & 0x1f) as u8;
        buf.put_u8(b1);
        buf.put_u8((self.pid & 0xff) as u8);

        let mut b3 = (self.scrambling_control & 0x03) << 6;
        if self.adaptation_field_exists {
            b3 |= 0x20;
        }
        if self.contains_payload {
            b3 |= 0x10;
        }
        b3 |= self.continuity_counter & 0x0f;
        buf.put_u8(b3);
    }
}

/// The parts of the adaptation field the demuxer acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdaptationField {
    /// Value of `adaptation_field_length`; the field occupies `length + 1` bytes.
    pub length: usize,
    pub discontinuity: bool,
    pub random_access: bool,
    /// Program clock reference in 27 MHz ticks.
    pub pcr: Option<u64>,
}

impl AdaptationField {
    /// Parses the adaptation field that starts at `packet[TS_HEADER_SIZE]`.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let offset = TS_HEADER_SIZE;
        let Some(&length) = packet.get(offset) else {
            return Err(TsError::InvalidData("adaptation field length missing".into()));
        };
        let length = length as usize;
        // With a payload the field may use at most 183 bytes, without one exactly 183.
        if offset + 1 + length > packet.len() {
            return Err(TsError::InvalidData(format!("adaptation field of {} bytes overruns packet", length)));
        }

        let mut field = AdaptationField {
            length,
            ..Default::default()
        };
        if length == 0 {
            return Ok(field);
        }

        let flags = packet[offset + 1];
        field.discontinuity = (flags & 0x80) != 0;
        field.random_access = (flags & 0x40) != 0;

        if (flags & 0x10) != 0 {
            if length < 7 {
                return Err(TsError::InvalidData("PCR data too short".into()));
            }
            let pos = offset + 2;
            let pcr_base = ((packet[pos] as u64) << 25)
                | ((packet[pos + 1] as u64) << 17)
                | ((packet[pos + 2] as u64) << 9)
                | ((packet[pos + 3] as u64) << 1)
                | ((packet[pos + 4] & 0x80) as u64 >> 7);
            let pcr_ext = (((packet[pos + 4] & 0x01) as u64) << 8) | (packet[pos + 5] as u64);
            field.pcr = Some(pcr_base * 300 + pcr_ext);
        }

        Ok(field)
    }

    /// Writes a field of exactly `total_len` bytes (length byte included),
    /// padded with 0xFF stuffing.
    pub fn write_stuffing(buf: &mut BytesMut, total_len: usize, discontinuity: bool) {
        debug_assert!(total_len >= 1 && total_len <= TS_MAX_PAYLOAD_SIZE);
        buf.put_u8((total_len - 1) as u8);
        if total_len == 1 {
            return;
        }
        buf.put_u8(if discontinuity { 0x80 } else { 0x00 });
        buf.put_bytes(0xFF, total_len - 2);
    }
}

// Time conversion utilities
pub fn pcr_to_time(pcr: u64) -> Duration {
    Duration::from_nanos(((pcr as u128 * 1_000_000_000) / PCR_HZ as u128) as u64)
}

pub fn pts_to_time(pts: u64) -> Duration {
    Duration::from_nanos(((pts as u128 * 1_000_000_000) / PTS_HZ as u128) as u64)
}

pub fn time_to_pts(time: Duration) -> u64 {
    (time.as_nanos() * PTS_HZ as u128 / 1_000_000_000) as u64
}
