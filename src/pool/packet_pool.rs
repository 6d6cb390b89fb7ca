use super::buffer_pool::{BufferPool, PoolStats};
use super::packet::PesPacket;
use log::trace;
use std::sync::Arc;

/// Hands out and recycles [`PesPacket`]s on top of a shared [`BufferPool`].
///
/// Cloning is cheap: every clone shares the same free lists, so the parser
/// thread can allocate while consumer threads free.
#[derive(Clone, Debug, Default)]
pub struct PacketPool {
    buffers: Arc<BufferPool>,
}

impl PacketPool {
    pub fn new(max_cached_per_tier: usize) -> Self {
        Self {
            buffers: Arc::new(BufferPool::new(max_cached_per_tier)),
        }
    }

    /// A packet with `length == min_len`, `index == 0`, no timing, and a
    /// capacity of at least `min_len`.
    pub fn allocate(&self, min_len: usize) -> PesPacket {
        PesPacket::from_buffer(self.buffers.allocate(min_len), min_len)
    }

    /// Returns the packet's buffer to the pool. Takes ownership, so the same
    /// packet can never be freed twice.
    pub fn free(&self, packet: PesPacket) {
        self.buffers.free(packet.into_buffer());
    }

    /// A fresh packet holding `length` bytes of `source` starting at absolute
    /// buffer offset `index`. Timing fields are carried over.
    pub fn copy(&self, source: &PesPacket, index: usize, length: usize) -> PesPacket {
        let mut packet = self.allocate(length);
        packet.data_mut().copy_from_slice(&source.buffer()[index..index + length]);
        packet.pts = source.pts;
        packet.dts = source.dts;
        packet.duration = source.duration;
        packet
    }

    /// Moves the packet into the smallest tier that holds its payload when
    /// that tier is smaller than the current buffer.
    pub fn trim(&self, packet: PesPacket) -> PesPacket {
        if self.buffers.tier_size(packet.len()) >= packet.capacity() {
            return packet;
        }
        trace!("trimming packet of {} bytes from capacity {}", packet.len(), packet.capacity());
        let trimmed = self.copy(&packet, packet.index(), packet.len());
        self.free(packet);
        trimmed
    }

    pub fn stats(&self) -> PoolStats {
        self.buffers.stats()
    }
}
