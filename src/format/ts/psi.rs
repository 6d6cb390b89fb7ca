//! Program Specific Information: section assembly, PAT and PMT decoding.

use super::parser::TsPacket;
use super::types::*;
use crate::codec::StreamHandlerKind;
use crate::error::{Result, TsError};
use crate::utils::crc::Crc32Mpeg2;
use log::trace;

/// Private sections may be up to 4096 bytes; PAT/PMT stay far below.
const MAX_SECTION_SIZE: usize = 4096;

/// Reassembles PSI sections from the payloads of one PID.
///
/// Handles `pointer_field`, sections spanning several packets, several
/// sections in one packet, and 0xFF stuffing after the last section.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buffer: Vec<u8>,
    synchronized: bool,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one packet; `on_section` receives every section it completes.
    pub fn push<F>(&mut self, packet: &TsPacket<'_>, mut on_section: F)
    where
        F: FnMut(&[u8]),
    {
        if packet.continuity_error {
            self.reset();
        }

        let payload = packet.payload;
        if payload.is_empty() {
            return;
        }

        if !packet.payload_unit_start() {
            if self.synchronized {
                self.append(payload, &mut on_section);
            }
            return;
        }

        let pointer = payload[0] as usize;
        if 1 + pointer > payload.len() {
            trace!("pointer_field {} overruns payload", pointer);
            self.reset();
            return;
        }

        let (tail, rest) = payload[1..].split_at(pointer);
        if self.synchronized && !tail.is_empty() {
            self.append(tail, &mut on_section);
        }

        self.buffer.clear();
        self.synchronized = true;
        self.append(rest, &mut on_section);
    }

    fn append<F>(&mut self, data: &[u8], on_section: &mut F)
    where
        F: FnMut(&[u8]),
    {
        self.buffer.extend_from_slice(data);

        let mut start = 0;
        while start < self.buffer.len() {
            let pending = &self.buffer[start..];
            if pending[0] == 0xFF {
                // Stuffing runs to the end of the packet.
                self.buffer.clear();
                self.synchronized = false;
                return;
            }
            if pending.len() < 3 {
                break;
            }

            let section_len = 3 + ((((pending[1] & 0x0F) as usize) << 8) | pending[2] as usize);
            if section_len > MAX_SECTION_SIZE {
                trace!("section length {} exceeds maximum", section_len);
                self.reset();
                return;
            }
            if pending.len() < section_len {
                break;
            }

            on_section(&pending[..section_len]);
            start += section_len;
        }

        self.buffer.drain(..start);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.synchronized = false;
    }
}

/// A long-form PSI section whose CRC has been verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    pub table_id: u8,
    pub table_id_extension: u16,
    pub version: u8,
    pub current_next: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    /// Table body between the section header and the CRC.
    pub body: &'a [u8],
}

impl<'a> Section<'a> {
    /// Validates length, syntax indicator, CRC and section numbering before
    /// any field is exposed.
    pub fn parse(data: &'a [u8], crc: &Crc32Mpeg2) -> Result<Self> {
        if data.len() < 12 {
            return Err(TsError::InvalidData(format!("section of {} bytes is too short", data.len())));
        }
        let section_len = 3 + ((((data[1] & 0x0F) as usize) << 8) | data[2] as usize);
        if section_len != data.len() {
            return Err(TsError::InvalidData("section length does not match data".into()));
        }
        if (data[1] & 0x80) == 0 {
            return Err(TsError::InvalidData("section_syntax_indicator not set".into()));
        }
        if !crc.verify(data) {
            return Err(TsError::InvalidData("section CRC mismatch".into()));
        }

        let section = Section {
            table_id: data[0],
            table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
            version: (data[5] >> 1) & 0x1F,
            current_next: (data[5] & 0x01) != 0,
            section_number: data[6],
            last_section_number: data[7],
            body: &data[8..data.len() - 4],
        };
        if section.last_section_number < section.section_number {
            return Err(TsError::InvalidData(format!(
                "section_number {} beyond last_section_number {}",
                section.section_number, section.last_section_number
            )));
        }
        Ok(section)
    }
}

#[derive(Debug)]
struct Collection {
    version: u8,
    last_section_number: u8,
    bodies: Vec<Vec<u8>>,
}

/// Collects the sections of one table version in order.
///
/// A table is released only when sections `0..=last_section_number` of a
/// single `current_next` version arrived in sequence. Anything else
/// (a gap, a repeated section, a version or `last_section_number` change)
/// discards the collection in progress.
#[derive(Debug, Default)]
struct TableCollector {
    active_version: Option<u8>,
    collecting: Option<Collection>,
}

impl TableCollector {
    fn add(&mut self, section: &Section<'_>) -> Option<Vec<Vec<u8>>> {
        if !section.current_next {
            return None;
        }
        if self.active_version == Some(section.version) {
            return None;
        }

        if section.section_number == 0 {
            self.collecting = Some(Collection {
                version: section.version,
                last_section_number: section.last_section_number,
                bodies: Vec::with_capacity(section.last_section_number as usize + 1),
            });
        }

        let collection = self.collecting.as_mut()?;
        if collection.version != section.version
            || collection.last_section_number != section.last_section_number
            || collection.bodies.len() != section.section_number as usize
        {
            trace!(
                "discarding table collection: got section {} v{} while expecting section {} v{}",
                section.section_number,
                section.version,
                collection.bodies.len(),
                collection.version
            );
            self.collecting = None;
            return None;
        }

        collection.bodies.push(section.body.to_vec());
        if collection.bodies.len() <= collection.last_section_number as usize {
            return None;
        }

        let done = self.collecting.take()?;
        self.active_version = Some(done.version);
        Some(done.bodies)
    }

    fn reset(&mut self) {
        self.active_version = None;
        self.collecting = None;
    }
}

/// A PAT entry for a real program (program 0 is never reported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Program set change produced by a completed PAT version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatUpdate {
    pub version: u8,
    pub transport_stream_id: u16,
    pub removed: Vec<ProgramEntry>,
    pub added: Vec<ProgramEntry>,
}

/// Decodes PAT versions and diffs each against the active program set.
#[derive(Debug, Default)]
pub struct PatDecoder {
    collector: TableCollector,
    programs: Vec<ProgramEntry>,
}

impl PatDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, section: &Section<'_>) -> Option<PatUpdate> {
        if section.table_id != TABLE_ID_PAT {
            return None;
        }
        let bodies = self.collector.add(section)?;

        let mut programs: Vec<ProgramEntry> = bodies
            .iter()
            .flat_map(|body| body.chunks_exact(4))
            .filter_map(|entry| {
                let program_number = ((entry[0] as u16) << 8) | entry[1] as u16;
                let pmt_pid = (((entry[2] & 0x1F) as u16) << 8) | entry[3] as u16;
                // Program 0 points at the network information table.
                (program_number != 0).then_some(ProgramEntry { program_number, pmt_pid })
            })
            .collect();
        programs.sort();
        programs.dedup_by_key(|p| p.program_number);

        let removed = self.programs.iter().filter(|p| !programs.contains(p)).copied().collect();
        let added = programs.iter().filter(|p| !self.programs.contains(p)).copied().collect();
        self.programs = programs;

        Some(PatUpdate {
            version: section.version,
            transport_stream_id: section.table_id_extension,
            removed,
            added,
        })
    }

    pub fn programs(&self) -> &[ProgramEntry] {
        &self.programs
    }

    /// Forgets the active version and program list; the next PAT reports
    /// every program as added.
    pub fn reset(&mut self) {
        self.collector.reset();
        self.programs.clear();
    }
}

/// One elementary stream of a program, as announced by its PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramStream {
    pub pid: u16,
    pub stream_type: u8,
    pub kind: StreamType,
    pub handler: StreamHandlerKind,
    /// ISO 639 language code from descriptor 0x0a.
    pub language: Option<String>,
    pub blocked: bool,
}

/// The complete stream set of one PMT version. Handed to the caller's
/// streams handler before any stream is registered, so streams can be
/// blocked first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramStreams {
    pub program_number: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub language: Option<String>,
    streams: Vec<ProgramStream>,
}

impl ProgramStreams {
    pub fn streams(&self) -> &[ProgramStream] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [ProgramStream] {
        &mut self.streams
    }

    /// Marks the stream on `pid` as (un)wanted. Returns false when the
    /// program has no such stream.
    pub fn set_blocked(&mut self, pid: u16, blocked: bool) -> bool {
        match self.streams.iter_mut().find(|s| s.pid == pid) {
            Some(stream) => {
                stream.blocked = blocked;
                true
            }
            None => false,
        }
    }

    /// Blocks every audio stream except the first one.
    pub fn block_secondary_audio(&mut self) {
        let mut seen_audio = false;
        for stream in self.streams.iter_mut().filter(|s| s.kind == StreamType::Audio) {
            stream.blocked = seen_audio;
            seen_audio = true;
        }
    }

    pub fn into_streams(self) -> Vec<ProgramStream> {
        self.streams
    }
}

/// Decodes the PMT versions of one program.
#[derive(Debug)]
pub struct PmtDecoder {
    program_number: u16,
    collector: TableCollector,
}

impl PmtDecoder {
    pub fn new(program_number: u16) -> Self {
        Self {
            program_number,
            collector: TableCollector::default(),
        }
    }

    pub fn program_number(&self) -> u16 {
        self.program_number
    }

    pub fn add_section(&mut self, section: &Section<'_>) -> Option<ProgramStreams> {
        if section.table_id != TABLE_ID_PMT || section.table_id_extension != self.program_number {
            return None;
        }
        let version = section.version;
        let bodies = self.collector.add(section)?;

        let mut program = ProgramStreams {
            program_number: self.program_number,
            version,
            pcr_pid: PID_NULL,
            language: None,
            streams: Vec::new(),
        };
        for body in &bodies {
            if let Err(e) = parse_pmt_body(body, &mut program) {
                // The CRC matched, so this is an encoder bug; the version is
                // still dropped as a whole.
                trace!("malformed PMT for program {}: {}", self.program_number, e);
                self.collector.reset();
                return None;
            }
        }
        Some(program)
    }

    pub fn reset(&mut self) {
        self.collector.reset();
    }
}

fn parse_pmt_body(body: &[u8], program: &mut ProgramStreams) -> Result<()> {
    if body.len() < 4 {
        return Err(TsError::InvalidData("PMT too short for PCR PID".into()));
    }
    program.pcr_pid = (((body[0] & 0x1F) as u16) << 8) | body[1] as u16;
    let program_info_length = (((body[2] & 0x0F) as usize) << 8) | body[3] as usize;
    let mut pos = 4;
    if pos + program_info_length > body.len() {
        return Err(TsError::InvalidData("program info data too short".into()));
    }
    let program_info = Descriptors::parse(&body[pos..pos + program_info_length])?;
    if program.language.is_none() {
        program.language = program_info.language;
    }
    pos += program_info_length;

    while pos + 5 <= body.len() {
        let stream_type = body[pos];
        let pid = (((body[pos + 1] & 0x1F) as u16) << 8) | body[pos + 2] as u16;
        let es_info_length = (((body[pos + 3] & 0x0F) as usize) << 8) | body[pos + 4] as usize;
        pos += 5;
        if pos + es_info_length > body.len() {
            return Err(TsError::InvalidData("ES info data too short".into()));
        }
        let descriptors = Descriptors::parse(&body[pos..pos + es_info_length])?;
        pos += es_info_length;

        program.streams.push(ProgramStream {
            pid,
            stream_type,
            kind: StreamType::classify(stream_type, descriptors.ac3),
            handler: StreamHandlerKind::for_stream_type(stream_type, descriptors.ac3),
            language: descriptors.language,
            blocked: false,
        });
    }
    Ok(())
}

/// The descriptor facts the demuxer uses.
#[derive(Debug, Default)]
struct Descriptors {
    language: Option<String>,
    ac3: bool,
}

impl Descriptors {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut found = Descriptors::default();
        let mut pos = 0;
        while pos + 2 <= data.len() {
            let tag = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;
            if pos + length > data.len() {
                return Err(TsError::InvalidData("descriptor data too short".into()));
            }
            let payload = &data[pos..pos + length];
            match tag {
                DESCRIPTOR_ISO_639_LANGUAGE if length >= 3 && found.language.is_none() => {
                    let code: String = payload[..3]
                        .iter()
                        .filter(|b| b.is_ascii_alphanumeric())
                        .map(|&b| b as char)
                        .collect();
                    if !code.is_empty() {
                        found.language = Some(code);
                    }
                }
                DESCRIPTOR_AC3 => found.ac3 = true,
                DESCRIPTOR_REGISTRATION if payload.starts_with(b"AC-3") => found.ac3 = true,
                _ => {}
            }
            pos += length;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::writer::{pat_section, pmt_section, PmtStreamSpec, TsPacketizer};
    use pretty_assertions::assert_eq;

    fn parse_all(sections: &[Vec<u8>]) -> Vec<Section<'_>> {
        let crc = Crc32Mpeg2::new();
        sections.iter().map(|s| Section::parse(s, &crc).unwrap()).collect()
    }

    #[test]
    fn test_section_parse_rejects_flipped_bit() {
        let crc = Crc32Mpeg2::new();
        let section = pat_section(1, 0, 0, 0, &[(1, 0x100)]);
        assert!(Section::parse(&section, &crc).is_ok());
        for bit in 0..section.len() * 8 {
            let mut corrupted = section.clone();
            corrupted[bit / 8] ^= 0x80 >> (bit % 8);
            assert!(Section::parse(&corrupted, &crc).is_err(), "bit {}", bit);
        }
    }

    #[test]
    fn test_section_parse_rejects_last_below_number() {
        let crc = Crc32Mpeg2::new();
        let section = pat_section(1, 0, 2, 1, &[(1, 0x100)]);
        assert!(Section::parse(&section, &crc).is_err());
    }

    #[test]
    fn test_pat_ignores_network_program_and_diffs() {
        let sections = vec![
            pat_section(1, 0, 0, 0, &[(0, 0x10), (1, 0x100), (2, 0x200)]),
            pat_section(1, 1, 0, 0, &[(2, 0x200), (3, 0x300)]),
        ];
        let parsed = parse_all(&sections);
        let mut decoder = PatDecoder::new();

        let first = decoder.add_section(&parsed[0]).unwrap();
        assert_eq!(
            first.added,
            vec![
                ProgramEntry { program_number: 1, pmt_pid: 0x100 },
                ProgramEntry { program_number: 2, pmt_pid: 0x200 },
            ]
        );
        assert!(first.removed.is_empty());

        // Same version again is a no-op.
        assert_eq!(decoder.add_section(&parsed[0]), None);

        let second = decoder.add_section(&parsed[1]).unwrap();
        assert_eq!(second.removed, vec![ProgramEntry { program_number: 1, pmt_pid: 0x100 }]);
        assert_eq!(second.added, vec![ProgramEntry { program_number: 3, pmt_pid: 0x300 }]);
    }

    #[test]
    fn test_pat_multi_section_requires_order() {
        let sections = vec![
            pat_section(1, 4, 0, 1, &[(1, 0x100)]),
            pat_section(1, 4, 1, 1, &[(2, 0x200)]),
        ];
        let parsed = parse_all(&sections);

        let mut decoder = PatDecoder::new();
        assert_eq!(decoder.add_section(&parsed[1]), None);
        assert_eq!(decoder.add_section(&parsed[0]), None);
        let update = decoder.add_section(&parsed[1]).unwrap();
        assert_eq!(update.added.len(), 2);
        assert_eq!(decoder.programs().len(), 2);
    }

    #[test]
    fn test_version_change_restarts_collection() {
        let sections = vec![
            pat_section(1, 4, 0, 1, &[(1, 0x100)]),
            pat_section(1, 5, 1, 1, &[(2, 0x200)]),
            pat_section(1, 5, 0, 1, &[(1, 0x100)]),
        ];
        let parsed = parse_all(&sections);
        let mut decoder = PatDecoder::new();
        assert_eq!(decoder.add_section(&parsed[0]), None);
        assert_eq!(decoder.add_section(&parsed[1]), None);
        assert_eq!(decoder.add_section(&parsed[2]), None);
        let update = decoder.add_section(&parsed[1]).unwrap();
        assert_eq!(update.version, 5);
    }

    #[test]
    fn test_not_current_section_ignored() {
        let mut section = pat_section(1, 0, 0, 0, &[(1, 0x100)]);
        section[5] &= !0x01;
        let crc = Crc32Mpeg2::new();
        let len = section.len();
        let value = crc.calculate(&section[..len - 4]);
        section[len - 4..].copy_from_slice(&value.to_be_bytes());

        let parsed = Section::parse(&section, &crc).unwrap();
        assert!(!parsed.current_next);
        assert_eq!(PatDecoder::new().add_section(&parsed), None);
    }

    #[test]
    fn test_pmt_streams_and_descriptors() {
        let streams = [
            PmtStreamSpec::new(STREAM_TYPE_H264, 0x101),
            PmtStreamSpec::new(STREAM_TYPE_AC3, 0x102).language("eng"),
            PmtStreamSpec::new(STREAM_TYPE_PRIVATE_PES, 0x103).ac3_descriptor().language("deu"),
            PmtStreamSpec::new(STREAM_TYPE_MPEG1_AUDIO, 0x104),
            PmtStreamSpec::new(0x86, 0x105),
        ];
        let sections = vec![pmt_section(7, 2, 0x101, &streams)];
        let parsed = parse_all(&sections);

        let mut decoder = PmtDecoder::new(7);
        let mut program = decoder.add_section(&parsed[0]).unwrap();
        assert_eq!(program.program_number, 7);
        assert_eq!(program.version, 2);
        assert_eq!(program.pcr_pid, 0x101);

        let summary: Vec<_> = program
            .streams()
            .iter()
            .map(|s| (s.pid, s.kind, s.handler, s.language.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0x101, StreamType::Video, StreamHandlerKind::Passthrough, None),
                (0x102, StreamType::Audio, StreamHandlerKind::Ac3, Some("eng".to_string())),
                (0x103, StreamType::Audio, StreamHandlerKind::Ac3, Some("deu".to_string())),
                (0x104, StreamType::Audio, StreamHandlerKind::Mp3, None),
                (0x105, StreamType::Other, StreamHandlerKind::Passthrough, None),
            ]
        );

        program.block_secondary_audio();
        let blocked: Vec<_> = program.streams().iter().filter(|s| s.blocked).map(|s| s.pid).collect();
        assert_eq!(blocked, vec![0x103, 0x104]);
        assert!(program.set_blocked(0x103, false));
        assert!(!program.set_blocked(0x999, true));

        // A PMT for another program is not ours.
        let other = vec![pmt_section(8, 0, 0x101, &streams)];
        let parsed = parse_all(&other);
        assert_eq!(PmtDecoder::new(7).add_section(&parsed[0]), None);
    }

    #[test]
    fn test_assembler_section_spanning_packets() {
        let streams: Vec<_> = (0..40).map(|i| PmtStreamSpec::new(STREAM_TYPE_AC3, 0x100 + i).language("eng")).collect();
        let section = pmt_section(1, 0, 0x100, &streams);
        assert!(section.len() > TS_MAX_PAYLOAD_SIZE);

        let mut packetizer = TsPacketizer::new();
        let packets = packetizer.section_packets(0x20, &section);
        assert!(packets.len() > 1);

        let mut assembler = SectionAssembler::new();
        let mut out = Vec::new();
        for raw in &packets {
            let packet = TsPacket::parse(raw).unwrap();
            assembler.push(&packet, |s| out.push(s.to_vec()));
        }
        assert_eq!(out, vec![section]);
    }

    #[test]
    fn test_assembler_pointer_field_and_two_sections() {
        use bytes::BytesMut;

        let first = pat_section(1, 0, 0, 0, &[(1, 0x100)]);
        let second = pat_section(1, 1, 0, 0, &[(2, 0x200)]);

        // Packet 1 starts `first` and carries only its first 5 bytes, padded
        // out with adaptation field stuffing.
        let mut p1 = BytesMut::new();
        TsHeader {
            payload_unit_start: true,
            adaptation_field_exists: true,
            ..Default::default()
        }
        .write_to(&mut p1);
        AdaptationField::write_stuffing(&mut p1, TS_MAX_PAYLOAD_SIZE - 6, false);
        p1.extend_from_slice(&[0x00]);
        p1.extend_from_slice(&first[..5]);
        assert_eq!(p1.len(), TS_PACKET_SIZE);

        // Packet 2 finishes `first` before its pointer_field target, then
        // holds `second` followed by stuffing.
        let tail = &first[5..];
        let mut p2 = BytesMut::new();
        TsHeader {
            payload_unit_start: true,
            continuity_counter: 1,
            ..Default::default()
        }
        .write_to(&mut p2);
        p2.extend_from_slice(&[tail.len() as u8]);
        p2.extend_from_slice(tail);
        p2.extend_from_slice(&second);
        p2.resize(TS_PACKET_SIZE, 0xFF);

        let mut assembler = SectionAssembler::new();
        let mut out = Vec::new();
        for raw in [&p1[..], &p2[..]] {
            let packet = TsPacket::parse(raw).unwrap();
            assembler.push(&packet, |s| out.push(s.to_vec()));
        }
        assert_eq!(out, vec![first, second]);
    }

    #[test]
    fn test_assembler_drops_on_continuity_error() {
        let streams: Vec<_> = (0..40).map(|i| PmtStreamSpec::new(STREAM_TYPE_AC3, 0x100 + i)).collect();
        let section = pmt_section(1, 0, 0x100, &streams);
        let mut packetizer = TsPacketizer::new();
        let packets = packetizer.section_packets(0x20, &section);

        let mut assembler = SectionAssembler::new();
        let mut out = Vec::new();
        for (i, raw) in packets.iter().enumerate() {
            let mut packet = TsPacket::parse(raw).unwrap();
            packet.continuity_error = i == 1;
            assembler.push(&packet, |s| out.push(s.to_vec()));
        }
        assert!(out.is_empty());
    }
}
