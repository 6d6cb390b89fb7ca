use super::{PacketSink, StreamConfig};
use crate::pool::{PacketPool, PesPacket};
use log::warn;
use std::time::Duration;

/// Forwards each PES unit unparsed as one packet (video, AAC and any other
/// stream type without a frame parser).
pub struct PassthroughHandler {
    stream_type: u8,
    pool: PacketPool,
    sink: Box<dyn PacketSink>,
    max_length: usize,
    current: Option<PesPacket>,
    written: usize,
    overflowed: bool,
    configured: bool,
}

impl PassthroughHandler {
    pub fn new(stream_type: u8, pool: PacketPool, sink: Box<dyn PacketSink>, max_length: usize) -> Self {
        Self {
            stream_type,
            pool,
            sink,
            max_length,
            current: None,
            written: 0,
            overflowed: false,
            configured: false,
        }
    }

    pub fn start_unit(&mut self, pts: Option<Duration>, dts: Option<Duration>) {
        self.abort_unit();
        if !self.configured {
            self.configured = true;
            self.sink.configure(StreamConfig::Elementary {
                stream_type: self.stream_type,
            });
        }

        let mut packet = self.pool.allocate(0);
        packet.pts = pts;
        packet.dts = dts;
        self.current = Some(packet);
        self.written = 0;
        self.overflowed = false;
    }

    pub fn data(&mut self, data: &[u8]) {
        if self.overflowed {
            return;
        }
        let Some(packet) = self.current.as_mut() else {
            return;
        };

        let needed = self.written + data.len();
        if needed > self.max_length {
            warn!(
                "dropping PES unit of stream type 0x{:02x}: exceeds {} bytes",
                self.stream_type, self.max_length
            );
            self.overflowed = true;
            if let Some(packet) = self.current.take() {
                self.pool.free(packet);
            }
            return;
        }

        if needed > packet.capacity() {
            let mut larger = self.pool.allocate(needed.max(packet.capacity() * 2));
            larger.buffer_mut()[..self.written].copy_from_slice(&packet.buffer()[..self.written]);
            larger.pts = packet.pts;
            larger.dts = packet.dts;
            if let Some(old) = self.current.replace(larger) {
                self.pool.free(old);
            }
        }

        if let Some(packet) = self.current.as_mut() {
            packet.buffer_mut()[self.written..needed].copy_from_slice(data);
            self.written = needed;
        }
    }

    pub fn end_unit(&mut self) {
        let Some(mut packet) = self.current.take() else {
            return;
        };
        if self.written == 0 {
            self.pool.free(packet);
            return;
        }
        packet.set_range(0, self.written);
        let packet = self.pool.trim(packet);
        self.sink.submit(packet);
    }

    pub fn abort_unit(&mut self) {
        if let Some(packet) = self.current.take() {
            self.pool.free(packet);
        }
        self.written = 0;
    }

    pub fn end_of_stream(&mut self) {
        self.end_unit();
        self.sink.end_of_stream();
    }
}

impl Drop for PassthroughHandler {
    fn drop(&mut self) {
        if let Some(packet) = self.current.take() {
            self.pool.free(packet);
        }
    }
}
