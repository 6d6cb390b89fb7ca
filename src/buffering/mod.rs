//! # Stream Buffering and Backpressure
//!
//! One [`StreamBuffer`] per elementary stream queues finished packets for
//! the consumer. A shared [`BufferingManager`] watches all of them and
//!
//! - holds playback back while the weakest stream refills (buffering),
//! - pauses upstream reads through a [`QueueThrottle`] once every stream
//!   is comfortably ahead, with hysteresis between two water marks,
//! - reports buffering progress.
//!
//! Decisions come from a pluggable [`BufferingPolicy`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tsdemux::buffering::{BufferingManager, NextPacket, QueueThrottle, StreamBuffer};
//! use tsdemux::config::BufferingConfig;
//! use tsdemux::pool::PacketPool;
//!
//! struct Reader;
//!
//! impl QueueThrottle for Reader {
//!     fn pause(&self) {}
//!     fn resume(&self) {}
//! }
//!
//! let pool = PacketPool::default();
//! let manager = Arc::new(BufferingManager::new(BufferingConfig::default(), Arc::new(Reader)));
//! let audio = StreamBuffer::new(manager.clone(), pool.clone());
//!
//! audio.enqueue(pool.allocate(128).with_pts(Duration::ZERO));
//! // Still short of the startup thresholds.
//! assert!(matches!(audio.next_packet(), NextPacket::Pending));
//! assert!(manager.buffering_progress().is_some());
//! ```

pub mod manager;
pub mod policy;
pub mod signal;
pub mod stream_buffer;

pub use manager::{BufferingManager, BufferingState, QueueId, QueueStats, QueueThrottle};
pub use policy::{BufferingPolicy, DefaultBufferingPolicy};
pub use signal::CoalescingSignal;
pub use stream_buffer::{NextPacket, StreamBuffer};
