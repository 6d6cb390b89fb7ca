use super::parser::{TsPacket, TsPacketReader, TsReaderStats};
use super::pes::PesReassembler;
use super::psi::{PatDecoder, PatUpdate, PmtDecoder, ProgramStream, ProgramStreams, Section, SectionAssembler};
use super::types::*;
use crate::codec::{PacketSink, StreamHandler, StreamHandlerKind};
use crate::config::DemuxerConfig;
use crate::error::{Result, TsError};
use crate::pool::PacketPool;
use crate::utils::crc::Crc32Mpeg2;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Decides whether a program announced in the PAT is decoded.
pub type ProgramFilter = Box<dyn FnMut(u16) -> bool + Send>;

/// Sees every completed PMT version before its streams are registered.
pub type StreamsHandler = Box<dyn FnMut(&mut ProgramStreams) + Send>;

/// Supplies the sink for a newly registered stream; `None` skips it.
pub type SinkFactory = Box<dyn FnMut(&ProgramStream) -> Option<Box<dyn PacketSink>> + Send>;

/// Counters kept by a [`TsDemuxer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxerStats {
    pub reader: TsReaderStats,
    /// PSI sections dropped for a CRC mismatch or a broken layout.
    pub rejected_sections: u64,
    pub pat_versions: u64,
    pub pmt_versions: u64,
    /// Packets on PIDs with nothing registered.
    pub unregistered_packets: u64,
}

enum PidHandler {
    Pmt {
        program_number: u16,
        assembler: SectionAssembler,
        decoder: PmtDecoder,
    },
    Stream {
        program_number: u16,
        reassembler: PesReassembler,
        handler: StreamHandler,
    },
}

#[derive(Debug)]
struct ActiveProgram {
    pmt_pid: u16,
    version: Option<u8>,
    streams: Vec<u16>,
}

/// PID registry of one demuxing session.
struct PidRouter {
    pat_assembler: SectionAssembler,
    pat: PatDecoder,
    pids: HashMap<u16, PidHandler>,
    programs: HashMap<u16, ActiveProgram>,
    program_filter: ProgramFilter,
    streams_handler: Option<StreamsHandler>,
    sink_factory: SinkFactory,
    pool: PacketPool,
    crc: Crc32Mpeg2,
    config: DemuxerConfig,
    stats: DemuxerStats,
}

impl PidRouter {
    fn route(&mut self, packet: &TsPacket<'_>) {
        let pid = packet.pid();
        if pid == PID_PAT {
            self.route_pat(packet);
            return;
        }

        let Some(entry) = self.pids.get_mut(&pid) else {
            self.stats.unregistered_packets += 1;
            return;
        };

        match entry {
            PidHandler::Pmt {
                program_number,
                assembler,
                decoder,
            } => {
                let program_number = *program_number;
                let crc = &self.crc;
                let stats = &mut self.stats;
                let mut completed = Vec::new();
                assembler.push(packet, |data| match Section::parse(data, crc) {
                    Ok(section) => {
                        if let Some(program) = decoder.add_section(&section) {
                            completed.push(program);
                        }
                    }
                    Err(e) => {
                        stats.rejected_sections += 1;
                        warn!("dropping PMT section on PID 0x{:04x}: {}", pid, e);
                    }
                });
                for program in completed {
                    self.activate_streams(program_number, program);
                }
            }
            PidHandler::Stream {
                reassembler, handler, ..
            } => {
                if packet.continuity_error {
                    warn!("continuity error on stream PID 0x{:04x}", pid);
                }
                reassembler.push(packet, handler);
            }
        }
    }

    fn route_pat(&mut self, packet: &TsPacket<'_>) {
        let crc = &self.crc;
        let pat = &mut self.pat;
        let stats = &mut self.stats;
        let mut updates = Vec::new();
        self.pat_assembler.push(packet, |data| match Section::parse(data, crc) {
            Ok(section) => {
                if let Some(update) = pat.add_section(&section) {
                    updates.push(update);
                }
            }
            Err(e) => {
                stats.rejected_sections += 1;
                warn!("dropping PAT section: {}", e);
            }
        });
        for update in updates {
            self.apply_pat(update);
        }
    }

    fn apply_pat(&mut self, update: PatUpdate) {
        self.stats.pat_versions += 1;
        debug!(
            "PAT version {} for transport stream {}: {} removed, {} added",
            update.version,
            update.transport_stream_id,
            update.removed.len(),
            update.added.len()
        );

        for entry in &update.removed {
            self.close_program(entry.program_number);
        }

        for entry in &update.added {
            if !(self.program_filter)(entry.program_number) {
                debug!("program {} filtered out", entry.program_number);
                continue;
            }
            if entry.pmt_pid == PID_PAT || entry.pmt_pid == PID_NULL || self.pids.contains_key(&entry.pmt_pid) {
                warn!(
                    "program {} announces unusable PMT PID 0x{:04x}",
                    entry.program_number, entry.pmt_pid
                );
                continue;
            }

            self.pids.insert(
                entry.pmt_pid,
                PidHandler::Pmt {
                    program_number: entry.program_number,
                    assembler: SectionAssembler::new(),
                    decoder: PmtDecoder::new(entry.program_number),
                },
            );
            self.programs.insert(
                entry.program_number,
                ActiveProgram {
                    pmt_pid: entry.pmt_pid,
                    version: None,
                    streams: Vec::new(),
                },
            );
            info!("program {} registered on PMT PID 0x{:04x}", entry.program_number, entry.pmt_pid);
        }
    }

    fn close_program(&mut self, program_number: u16) {
        let Some(program) = self.programs.remove(&program_number) else {
            return;
        };
        for pid in program.streams {
            self.remove_stream(pid);
        }
        self.pids.remove(&program.pmt_pid);
        info!("program {} closed", program_number);
    }

    fn remove_stream(&mut self, pid: u16) {
        if let Some(PidHandler::Stream {
            mut reassembler,
            mut handler,
            ..
        }) = self.pids.remove(&pid)
        {
            reassembler.flush(&mut handler);
            handler.end_of_stream();
            debug!("stream PID 0x{:04x} unregistered", pid);
        }
    }

    /// Applies one complete PMT version. Streams that keep their PID and
    /// handler kind carry on; everything else is torn down first and then
    /// the new set is registered in one pass.
    fn activate_streams(&mut self, program_number: u16, mut program: ProgramStreams) {
        let Some(active) = self.programs.get_mut(&program_number) else {
            return;
        };
        let pmt_pid = active.pmt_pid;
        let previous = std::mem::take(&mut active.streams);
        self.stats.pmt_versions += 1;

        if let Some(streams_handler) = self.streams_handler.as_mut() {
            streams_handler(&mut program);
        }
        let version = program.version;
        let wanted: Vec<ProgramStream> = program
            .into_streams()
            .into_iter()
            .filter(|s| !s.blocked && s.pid != PID_PAT && s.pid != PID_NULL && s.pid != pmt_pid)
            .collect();

        let mut kept = Vec::new();
        for pid in previous {
            let keep = match (self.pids.get(&pid), wanted.iter().find(|s| s.pid == pid)) {
                (Some(PidHandler::Stream { handler, .. }), Some(stream)) => handler.kind() == stream.handler,
                _ => false,
            };
            if keep {
                kept.push(pid);
            } else {
                self.remove_stream(pid);
            }
        }

        let mut registered = kept.clone();
        for stream in &wanted {
            if kept.contains(&stream.pid) {
                continue;
            }
            if self.pids.contains_key(&stream.pid) {
                warn!(
                    "program {} stream PID 0x{:04x} is already in use",
                    program_number, stream.pid
                );
                continue;
            }
            let Some(sink) = (self.sink_factory)(stream) else {
                debug!("no sink for stream PID 0x{:04x}, skipping", stream.pid);
                continue;
            };
            let handler = StreamHandler::new(stream.handler, stream.stream_type, self.pool.clone(), sink, &self.config);
            self.pids.insert(
                stream.pid,
                PidHandler::Stream {
                    program_number,
                    reassembler: PesReassembler::new(),
                    handler,
                },
            );
            registered.push(stream.pid);
            debug!(
                "stream PID 0x{:04x} registered: type 0x{:02x} {:?} {:?}",
                stream.pid, stream.stream_type, stream.kind, stream.handler
            );
        }

        if let Some(active) = self.programs.get_mut(&program_number) {
            active.version = Some(version);
            active.streams = registered;
        }
        info!(
            "program {} PMT version {} active with {} streams",
            program_number,
            version,
            self.programs.get(&program_number).map_or(0, |p| p.streams.len())
        );
    }

    fn sorted_stream_pids(&self) -> Vec<u16> {
        let mut pids: Vec<u16> = self
            .pids
            .iter()
            .filter(|(_, h)| matches!(h, PidHandler::Stream { .. }))
            .map(|(&pid, _)| pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    fn end_of_data(&mut self) {
        for pid in self.sorted_stream_pids() {
            if let Some(PidHandler::Stream {
                reassembler, handler, ..
            }) = self.pids.get_mut(&pid)
            {
                reassembler.flush(handler);
                handler.end_of_stream();
            }
        }
    }

    fn flush(&mut self) {
        self.pat_assembler.reset();
        for handler in self.pids.values_mut() {
            match handler {
                PidHandler::Pmt { assembler, .. } => assembler.reset(),
                PidHandler::Stream {
                    reassembler, handler, ..
                } => {
                    reassembler.reset(handler);
                    handler.flush();
                }
            }
        }
    }

    fn close_all(&mut self) {
        let mut programs: Vec<u16> = self.programs.keys().copied().collect();
        programs.sort_unstable();
        for program_number in programs {
            self.close_program(program_number);
        }
        self.pat.reset();
        self.pat_assembler.reset();
    }
}

/// MPEG-2 transport stream demuxer.
///
/// Raw chunks of any size go in through [`TsDemuxer::process_data`]. The
/// PAT and PMTs configure the PID registry; each registered elementary
/// stream gets a [`StreamHandler`] whose packets land in the sink the
/// [`SinkFactory`] supplied for it.
///
/// # Example
///
/// ```rust
/// use tsdemux::format::ts::TsDemuxer;
///
/// # fn main() -> tsdemux::Result<()> {
/// let mut demuxer = TsDemuxer::builder()
///     .program_filter(|program| program == 1)
///     .streams_handler(|streams| streams.block_secondary_audio())
///     .sink_factory(|_stream| None)
///     .build()?;
///
/// demuxer.process_data(&[0x47; 10]);
/// demuxer.process_end_of_data();
/// assert!(demuxer.programs().is_empty());
/// # Ok(())
/// # }
/// ```
pub struct TsDemuxer {
    reader: TsPacketReader,
    router: PidRouter,
}

impl TsDemuxer {
    pub fn builder() -> TsDemuxerBuilder {
        TsDemuxerBuilder::default()
    }

    /// Feeds one chunk. Packets are dispatched in input order; a trailing
    /// partial packet waits for the next chunk.
    pub fn process_data(&mut self, data: &[u8]) {
        let router = &mut self.router;
        self.reader.process(data, |packet| router.route(packet));
    }

    /// End of input: finishes every PES unit in progress, drops incomplete
    /// audio frames and signals end of stream to every sink, in PID order.
    pub fn process_end_of_data(&mut self) {
        let router = &mut self.router;
        self.reader.finish(|packet| router.route(packet));
        trace!("end of data after {} packets", self.reader.stats().packets);
        self.router.end_of_data();
    }

    /// Drops all partial packet, section, unit and frame state (seek).
    /// Programs and stream registrations stay in place.
    pub fn flush(&mut self) {
        self.reader.reset();
        self.router.flush();
    }

    /// Tears down every program, signalling end of stream to its sinks, and
    /// forgets the PAT so the next one is applied from scratch.
    pub fn close(&mut self) {
        self.router.close_all();
        self.reader.reset();
    }

    /// Reads `reader` to its end in chunks of `read_chunk_size`, then calls
    /// [`TsDemuxer::process_end_of_data`]. Returns the number of bytes read.
    pub async fn read_from<R>(&mut self, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.router.config.read_chunk_size];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            self.process_data(&buf[..n]);
        }
        self.process_end_of_data();
        Ok(total)
    }

    /// Active program numbers, ascending.
    pub fn programs(&self) -> Vec<u16> {
        let mut programs: Vec<u16> = self.router.programs.keys().copied().collect();
        programs.sort_unstable();
        programs
    }

    /// PMT version in effect for `program_number`, once one was applied.
    pub fn program_version(&self, program_number: u16) -> Option<u8> {
        self.router.programs.get(&program_number).and_then(|p| p.version)
    }

    /// Elementary stream PIDs with a registered handler, ascending.
    pub fn stream_pids(&self) -> Vec<u16> {
        self.router.sorted_stream_pids()
    }

    /// Handler kind and owning program of a registered stream PID.
    pub fn stream_handler(&self, pid: u16) -> Option<(u16, StreamHandlerKind)> {
        match self.router.pids.get(&pid) {
            Some(PidHandler::Stream {
                program_number, handler, ..
            }) => Some((*program_number, handler.kind())),
            _ => None,
        }
    }

    pub fn pool(&self) -> &PacketPool {
        &self.router.pool
    }

    pub fn stats(&self) -> DemuxerStats {
        DemuxerStats {
            reader: self.reader.stats(),
            ..self.router.stats
        }
    }
}

impl std::fmt::Debug for TsDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsDemuxer")
            .field("programs", &self.router.programs)
            .field("stream_pids", &self.stream_pids())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Configures a [`TsDemuxer`]. A sink factory is required.
#[derive(Default)]
pub struct TsDemuxerBuilder {
    program_filter: Option<ProgramFilter>,
    streams_handler: Option<StreamsHandler>,
    sink_factory: Option<SinkFactory>,
    config: DemuxerConfig,
    pool: Option<PacketPool>,
}

impl TsDemuxerBuilder {
    /// Programs for which `filter` returns false are ignored. By default
    /// every program is decoded.
    pub fn program_filter<F>(mut self, filter: F) -> Self
    where
        F: FnMut(u16) -> bool + Send + 'static,
    {
        self.program_filter = Some(Box::new(filter));
        self
    }

    /// Lets the caller block streams of each PMT version before they are
    /// registered.
    pub fn streams_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut ProgramStreams) + Send + 'static,
    {
        self.streams_handler = Some(Box::new(handler));
        self
    }

    pub fn sink_factory<F>(mut self, factory: F) -> Self
    where
        F: FnMut(&ProgramStream) -> Option<Box<dyn PacketSink>> + Send + 'static,
    {
        self.sink_factory = Some(Box::new(factory));
        self
    }

    pub fn config(mut self, config: DemuxerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing pool, e.g. with the consumers freeing packets.
    pub fn pool(mut self, pool: PacketPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Result<TsDemuxer> {
        let sink_factory = self
            .sink_factory
            .ok_or_else(|| TsError::Config("a TS demuxer needs a sink factory".into()))?;
        if self.config.read_chunk_size == 0 {
            return Err(TsError::Config("read_chunk_size must be positive".into()));
        }
        let pool = match self.pool {
            Some(pool) => pool,
            None if self.config.pool_max_cached_per_tier == 0 => {
                return Err(TsError::Config("pool_max_cached_per_tier must be positive".into()));
            }
            None => PacketPool::new(self.config.pool_max_cached_per_tier),
        };

        Ok(TsDemuxer {
            reader: TsPacketReader::new(),
            router: PidRouter {
                pat_assembler: SectionAssembler::new(),
                pat: PatDecoder::new(),
                pids: HashMap::new(),
                programs: HashMap::new(),
                program_filter: self.program_filter.unwrap_or_else(|| Box::new(|_| true)),
                streams_handler: self.streams_handler,
                sink_factory,
                pool,
                crc: Crc32Mpeg2::new(),
                config: self.config,
                stats: DemuxerStats::default(),
            },
        })
    }
}
