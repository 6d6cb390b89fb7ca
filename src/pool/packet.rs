use std::fmt;
use std::time::Duration;

/// A pool-managed media packet: a `[index, index + length)` window over a
/// pooled buffer plus timing.
///
/// A packet has exactly one owner at any time (a parser stage, a stream
/// buffer queue, or the pool's free list). It is moved, never cloned.
pub struct PesPacket {
    buffer: Vec<u8>,
    index: usize,
    length: usize,
    pub pts: Option<Duration>,
    pub dts: Option<Duration>,
    pub duration: Option<Duration>,
}

impl PesPacket {
    pub(crate) fn from_buffer(buffer: Vec<u8>, length: usize) -> Self {
        assert!(length <= buffer.len(), "packet length {} exceeds buffer of {}", length, buffer.len());
        Self {
            buffer,
            index: 0,
            length,
            pts: None,
            dts: None,
            duration: None,
        }
    }

    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// The packet's payload window.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.index..self.index + self.length]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.index..self.index + self.length]
    }

    /// The whole backing buffer, independent of the window.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Moves the payload window. Panics when the window leaves the buffer:
    /// that is a caller bug, not a stream condition.
    pub fn set_range(&mut self, index: usize, length: usize) {
        assert!(
            index.checked_add(length).is_some_and(|end| end <= self.buffer.len()),
            "range {}+{} outside buffer of {}",
            index,
            length,
            self.buffer.len()
        );
        self.index = index;
        self.length = length;
    }

    /// Presentation timestamp, falling back to the decode timestamp.
    pub fn timestamp(&self) -> Option<Duration> {
        self.pts.or(self.dts)
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

impl fmt::Debug for PesPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PesPacket")
            .field("index", &self.index)
            .field("length", &self.length)
            .field("capacity", &self.buffer.len())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .finish()
    }
}
