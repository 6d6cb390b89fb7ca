#![doc(html_root_url = "https://docs.rs/tsdemux/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsdemux - MPEG-2 Transport Stream Demuxing Core
//!
//! `tsdemux` turns a raw MPEG-2 transport stream into per-stream queues of
//! timestamped packets, ready for a real-time consumer. It is a pure,
//! non-blocking byte-in/packet-out pipeline: fetching bytes and rendering
//! samples belong to the caller.
//!
//! ## Features
//!
//! ### Demuxing
//! - 188-byte packet framing with resynchronization and continuity tracking
//! - CRC-checked PAT/PMT decoding, applied one complete version at a time
//! - PES reassembly with PTS/DTS extraction and 33-bit wrap handling
//!
//! ### Audio Framing
//! - MP3 (MPEG-1/2/2.5, layers I-III) and AC-3 frame sync and header parsing
//! - One pooled packet per audio frame with a running timestamp
//! - Shoutcast (ICY) metadata stripping
//!
//! ### Buffering
//! - Tiered, lock-free buffer pool; no steady-state allocation
//! - Per-stream FIFO queues with a cross-stream buffering manager
//! - Edge-triggered read pause/resume with hysteresis
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsdemux::buffering::{BufferingManager, QueueThrottle, StreamBuffer};
//! use tsdemux::codec::PacketSink;
//! use tsdemux::config::Config;
//! use tsdemux::format::ts::TsDemuxer;
//! use tsdemux::pool::PacketPool;
//!
//! struct Reader;
//!
//! impl QueueThrottle for Reader {
//!     fn pause(&self) {}
//!     fn resume(&self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let pool = PacketPool::new(config.demuxer.pool_max_cached_per_tier);
//!     let manager = Arc::new(BufferingManager::new(config.buffering.clone(), Arc::new(Reader)));
//!
//!     let factory_pool = pool.clone();
//!     let mut demuxer = TsDemuxer::builder()
//!         .config(config.demuxer.clone())
//!         .pool(pool)
//!         .streams_handler(|streams| streams.block_secondary_audio())
//!         .sink_factory(move |_stream| {
//!             let buffer = StreamBuffer::new(manager.clone(), factory_pool.clone());
//!             Some(Box::new(buffer) as Box<dyn PacketSink>)
//!         })
//!         .build()?;
//!
//!     let file = tokio::fs::File::open("capture.ts").await?;
//!     demuxer.read_from(file).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `format::ts`: transport stream packets, PSI tables, PES units and the
//!   demuxer session
//! - `codec`: MP3/AC-3 frame parsers, pass-through handler, Shoutcast filter
//! - `buffering`: stream buffers, buffering manager, policy and throttle
//! - `pool`: buffer and packet pools
//! - `config`: buffering thresholds and demuxer settings
//! - `error`: error type and `Result` alias
//! - `utils`: bit reader and MPEG-2 CRC32

/// Stream buffers, buffering manager and backpressure policy
pub mod buffering;

/// Elementary stream handlers: audio frame parsers and pass-through
pub mod codec;

/// Configuration module
pub mod config;

/// Error types and utilities
pub mod error;

/// Container format implementations
pub mod format;

/// Buffer and packet pools
pub mod pool;

/// Common utilities and helper functions
pub mod utils;

pub use error::{Result, TsError};
