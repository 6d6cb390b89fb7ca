//! Transport stream packetizing: PAT/PMT sections and PES units split into
//! 188-byte packets with per-PID continuity counters.
//!
//! The demuxer never writes; this is the encoder side used to build
//! streams (tests, re-encapsulation tools).

use super::types::*;
use crate::utils::crc::Crc32Mpeg2;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Builds a complete PAT section, CRC included. `programs` holds
/// `(program_number, pmt_pid)` pairs.
///
/// # Panics
///
/// Panics if a PMT PID does not fit in 13 bits.
pub fn pat_section(
    transport_stream_id: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    programs: &[(u16, u16)],
) -> Vec<u8> {
    let mut body = BytesMut::with_capacity(programs.len() * 4);
    for &(program_number, pid) in programs {
        body.put_u16(program_number);
        assert!(pid <= PID_MAX, "PMT PID 0x{:x} of program {} is not a 13-bit PID", pid, program_number);
        body.put_u16(pid | 7 << 13);
    }
    long_section(
        TABLE_ID_PAT,
        transport_stream_id,
        version,
        section_number,
        last_section_number,
        &body,
    )
}

/// One elementary stream entry of a PMT being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStreamSpec {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: Vec<(u8, Vec<u8>)>,
}

impl PmtStreamSpec {
    pub fn new(stream_type: u8, pid: u16) -> Self {
        Self {
            stream_type,
            pid,
            descriptors: Vec::new(),
        }
    }

    /// Adds an ISO 639 language descriptor (audio type 0).
    pub fn language(mut self, code: &str) -> Self {
        let mut data = code.as_bytes().to_vec();
        data.resize(3, b' ');
        data.push(0);
        self.descriptors.push((DESCRIPTOR_ISO_639_LANGUAGE, data));
        self
    }

    /// Adds an empty DVB AC-3 descriptor.
    pub fn ac3_descriptor(mut self) -> Self {
        self.descriptors.push((DESCRIPTOR_AC3, vec![0x00]));
        self
    }
}

/// Builds a single-section PMT, CRC included. Panics if the PCR PID or a
/// stream PID does not fit in 13 bits.
pub fn pmt_section(program_number: u16, version: u8, pcr_pid: u16, streams: &[PmtStreamSpec]) -> Vec<u8> {
    let mut body = BytesMut::new();
    assert!(pcr_pid <= PID_MAX, "PCR PID 0x{:x} is not a 13-bit PID", pcr_pid);
    body.put_u16(pcr_pid | 7 << 13);
    body.put_u16(0xf << 12);

    for stream in streams {
        body.put_u8(stream.stream_type);
        assert!(stream.pid <= PID_MAX, "stream PID 0x{:x} is not a 13-bit PID", stream.pid);
        body.put_u16(stream.pid | 7 << 13);
        let es_info_len: usize = stream.descriptors.iter().map(|(_, d)| 2 + d.len()).sum();
        body.put_u16((es_info_len as u16) & 0x3ff | 0xf << 12);
        for (tag, data) in &stream.descriptors {
            body.put_u8(*tag);
            body.put_u8(data.len() as u8);
            body.put_slice(data);
        }
    }

    long_section(TABLE_ID_PMT, program_number, version, 0, 0, &body)
}

fn long_section(
    table_id: u8,
    table_id_extension: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    body: &[u8],
) -> Vec<u8> {
    // 5 bytes of extended header, the body and the CRC
    let section_length = 5 + body.len() + 4;
    let mut buf = BytesMut::with_capacity(3 + section_length);
    buf.put_u8(table_id);
    buf.put_u16(0xB000 | (section_length as u16 & 0x3FF));
    buf.put_u16(table_id_extension);
    buf.put_u8(0xC0 | (version & 0x1F) << 1 | 0x01);
    buf.put_u8(section_number);
    buf.put_u8(last_section_number);
    buf.put_slice(body);

    let crc = Crc32Mpeg2::new().calculate(&buf);
    buf.put_u32(crc);
    buf.to_vec()
}

/// Splits sections and PES units into transport packets.
#[derive(Debug, Default)]
pub struct TsPacketizer {
    continuity: HashMap<u16, u8>,
}

impl TsPacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }

    /// Packets for one section, starting with a zero `pointer_field`; the
    /// last packet is padded with 0xFF.
    pub fn section_packets(&mut self, pid: u16, section: &[u8]) -> Vec<Vec<u8>> {
        let mut payload = Vec::with_capacity(section.len() + 1);
        payload.push(0x00);
        payload.extend_from_slice(section);

        let mut packets = Vec::new();
        for (i, chunk) in payload.chunks(TS_MAX_PAYLOAD_SIZE).enumerate() {
            let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
            TsHeader {
                payload_unit_start: i == 0,
                pid,
                continuity_counter: self.next_cc(pid),
                ..Default::default()
            }
            .write_to(&mut buf);
            buf.put_slice(chunk);
            buf.resize(TS_PACKET_SIZE, 0xFF);
            packets.push(buf.to_vec());
        }
        packets
    }

    /// Packets for one PES unit. The final packet is padded through its
    /// adaptation field, as PES payload may not carry stuffing.
    pub fn pes_packets(&mut self, pid: u16, pes: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut pos = 0;
        while pos < pes.len() {
            let remaining = pes.len() - pos;
            let take = remaining.min(TS_MAX_PAYLOAD_SIZE);
            let stuffing = TS_MAX_PAYLOAD_SIZE - take;

            let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
            TsHeader {
                payload_unit_start: pos == 0,
                pid,
                adaptation_field_exists: stuffing > 0,
                continuity_counter: self.next_cc(pid),
                ..Default::default()
            }
            .write_to(&mut buf);
            if stuffing > 0 {
                AdaptationField::write_stuffing(&mut buf, stuffing, false);
            }
            buf.put_slice(&pes[pos..pos + take]);
            packets.push(buf.to_vec());
            pos += take;
        }
        packets
    }
}
