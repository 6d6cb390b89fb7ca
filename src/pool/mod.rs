//! # Buffer and Packet Pools
//!
//! Recycled storage for transport packets, PES payloads and elementary
//! stream frames. Buffers come in power-of-two tiers; each tier keeps a
//! bounded lock-free free list.
//!
//! ```rust
//! use tsdemux::pool::PacketPool;
//!
//! let pool = PacketPool::default();
//! let mut packet = pool.allocate(188);
//! packet.data_mut()[0] = 0x47;
//! pool.free(packet);
//! assert_eq!(pool.stats().outstanding, 0);
//! ```

mod buffer_pool;
mod packet;
mod packet_pool;

pub use buffer_pool::{BufferPool, PoolStats, MAX_TIER_SIZE, MIN_TIER_SIZE, TIER_COUNT};
pub use packet::PesPacket;
pub use packet_pool::PacketPool;
