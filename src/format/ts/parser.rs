use super::types::*;
use crate::error::Result;
use log::trace;
use std::collections::HashMap;

/// One transport packet, borrowed from the reader's input or its carry-over
/// buffer. Lives only for the duration of the dispatch callback.
#[derive(Debug, Clone, Copy)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    pub adaptation: Option<AdaptationField>,
    /// Payload bytes after the header and adaptation field.
    pub payload: &'a [u8],
    /// Set when the continuity counter skipped on this PID.
    pub continuity_error: bool,
}

impl<'a> TsPacket<'a> {
    /// Parses a complete 188-byte packet.
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let header = TsHeader::parse(raw)?;
        let mut payload_offset = TS_HEADER_SIZE;
        let adaptation = if header.adaptation_field_exists {
            let field = AdaptationField::parse(raw)?;
            payload_offset += field.length + 1;
            Some(field)
        } else {
            None
        };

        let payload = if header.contains_payload {
            &raw[payload_offset.min(raw.len())..]
        } else {
            &[]
        };

        Ok(TsPacket {
            header,
            adaptation,
            payload,
            continuity_error: false,
        })
    }

    pub fn pid(&self) -> u16 {
        self.header.pid
    }

    pub fn payload_unit_start(&self) -> bool {
        self.header.payload_unit_start
    }

    pub fn discontinuity_indicator(&self) -> bool {
        self.adaptation.is_some_and(|a| a.discontinuity)
    }
}

/// Counters kept by [`TsPacketReader`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsReaderStats {
    /// Packets handed to the callback.
    pub packets: u64,
    /// Times the reader lost alignment and scanned for a sync byte.
    pub sync_losses: u64,
    pub continuity_errors: u64,
    /// Packets dropped because `transport_error_indicator` was set.
    pub transport_errors: u64,
    /// Repeated packets dropped by continuity tracking.
    pub duplicates: u64,
    /// Packets dropped because their header or adaptation field was malformed.
    pub malformed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Continuity {
    last: u8,
    repeated: bool,
}

/// Splits unaligned byte chunks into 188-byte transport packets.
///
/// Packets fully contained in a chunk are dispatched in place; only a packet
/// straddling two chunks is copied into the carry-over buffer. While out of
/// sync, a 0x47 candidate is only trusted once the byte one packet later is
/// seen to be 0x47 too, however the input is chunked; until then the
/// candidate and the bytes after it wait in the carry-over buffer.
pub struct TsPacketReader {
    carry: Vec<u8>,
    synchronized: bool,
    continuity: HashMap<u16, Continuity>,
    stats: TsReaderStats,
}

impl TsPacketReader {
    pub fn new() -> Self {
        Self {
            carry: Vec::with_capacity(TS_PACKET_SIZE + 1),
            synchronized: false,
            continuity: HashMap::new(),
            stats: TsReaderStats::default(),
        }
    }

    /// Feeds a chunk. `on_packet` runs once per accepted packet, in input order.
    pub fn process<F>(&mut self, data: &[u8], mut on_packet: F)
    where
        F: FnMut(&TsPacket<'_>),
    {
        if !self.synchronized && !self.carry.is_empty() {
            // An unconfirmed candidate: rescan it together with the new bytes.
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(data);
            self.scan(&joined, &mut on_packet);
            return;
        }

        let mut pos = 0;
        if !self.carry.is_empty() {
            let take = (TS_PACKET_SIZE - self.carry.len()).min(data.len());
            self.carry.extend_from_slice(&data[..take]);
            pos = take;
            if self.carry.len() < TS_PACKET_SIZE {
                return;
            }
            let packet = std::mem::take(&mut self.carry);
            self.dispatch(&packet, &mut on_packet);
            self.carry = packet;
            self.carry.clear();
        }
        self.scan(&data[pos..], &mut on_packet);
    }

    /// End of input: a candidate still waiting for confirmation is accepted
    /// when a whole packet follows it.
    pub fn finish<F>(&mut self, mut on_packet: F)
    where
        F: FnMut(&TsPacket<'_>),
    {
        if !self.synchronized && self.carry.len() >= TS_PACKET_SIZE {
            let packet = std::mem::take(&mut self.carry);
            self.dispatch(&packet[..TS_PACKET_SIZE], &mut on_packet);
        }
        self.carry.clear();
    }

    fn scan<F>(&mut self, data: &[u8], on_packet: &mut F)
    where
        F: FnMut(&TsPacket<'_>),
    {
        let mut pos = 0;
        while pos < data.len() {
            if data[pos] != SYNC_BYTE {
                if self.synchronized {
                    self.synchronized = false;
                    self.stats.sync_losses += 1;
                    trace!("lost TS sync at chunk offset {}", pos);
                }
                pos += 1;
                continue;
            }

            if !self.synchronized {
                match data.get(pos + TS_PACKET_SIZE) {
                    None => {
                        self.carry.clear();
                        self.carry.extend_from_slice(&data[pos..]);
                        return;
                    }
                    Some(&next) if next != SYNC_BYTE => {
                        pos += 1;
                        continue;
                    }
                    Some(_) => {
                        trace!("TS sync acquired at chunk offset {}", pos);
                        self.synchronized = true;
                    }
                }
            }

            let end = pos + TS_PACKET_SIZE;
            if end > data.len() {
                self.carry.clear();
                self.carry.extend_from_slice(&data[pos..]);
                return;
            }
            self.dispatch(&data[pos..end], on_packet);
            pos = end;
        }
    }

    fn dispatch<F>(&mut self, raw: &[u8], on_packet: &mut F)
    where
        F: FnMut(&TsPacket<'_>),
    {
        let mut packet = match TsPacket::parse(raw) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                trace!("dropping malformed TS packet: {}", e);
                return;
            }
        };

        if packet.header.transport_error {
            self.stats.transport_errors += 1;
            return;
        }

        if !self.check_continuity(&mut packet) {
            return;
        }

        self.stats.packets += 1;
        on_packet(&packet);
    }

    /// Returns false for a packet that should be dropped as a duplicate.
    fn check_continuity(&mut self, packet: &mut TsPacket<'_>) -> bool {
        let pid = packet.pid();
        // The counter only advances on packets carrying payload.
        if pid == PID_NULL || !packet.header.contains_payload {
            return true;
        }

        let cc = packet.header.continuity_counter;
        let discontinuity = packet.discontinuity_indicator();
        let previous = self.continuity.insert(pid, Continuity { last: cc, repeated: false });

        let Some(previous) = previous else {
            return true;
        };
        if discontinuity {
            return true;
        }

        if cc == previous.last {
            if !previous.repeated {
                self.continuity.insert(pid, Continuity { last: cc, repeated: true });
                self.stats.duplicates += 1;
                return false;
            }
        } else if cc == (previous.last + 1) & 0x0F {
            return true;
        }

        self.stats.continuity_errors += 1;
        packet.continuity_error = true;
        trace!("continuity error on PID 0x{:04x}: {} -> {}", pid, previous.last, cc);
        true
    }

    /// Forgets alignment, the carry-over bytes and continuity history.
    /// Statistics are kept.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.synchronized = false;
        self.continuity.clear();
    }

    pub fn stats(&self) -> TsReaderStats {
        self.stats
    }
}

impl Default for TsPacketReader {
    fn default() -> Self {
        Self::new()
    }
}
