//! Container formats. Only the MPEG-2 transport stream is demuxed.

/// MPEG-2 transport stream demuxing and packetizing
pub mod ts;
