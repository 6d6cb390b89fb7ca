use crate::error::{Result, TsError};

/// A big-endian bit reader over a byte slice.
///
/// Used for the bit-packed fields of audio frame headers (AC-3 `bsi`,
/// MPEG audio header word) where fields straddle byte boundaries.
///
/// Example:
/// ```
/// use tsdemux::utils::BitReader;
///
/// let data = [0b10110011];
/// let mut reader = BitReader::new(&data);
///
/// assert_eq!(reader.read_bit().unwrap(), true);    // 1
/// assert_eq!(reader.read_bits(3).unwrap(), 0b011); // 011
/// ```
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    /// Reads a single bit. Errors at end of data.
    pub fn read_bit(&mut self) -> Result<bool> {
        if self.byte_offset >= self.data.len() {
            return Err(TsError::Parser("bit reader exhausted".into()));
        }

        let bit = (self.data[self.byte_offset] >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;

        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }

        Ok(bit == 1)
    }

    /// Reads `n` bits (at most 32) MSB first.
    ///
    /// Byte-aligned runs are consumed a whole byte at a time.
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        if n > 32 {
            return Err(TsError::Parser(format!("cannot read {} bits at once", n)));
        }
        if (n as usize) > self.available_bits() {
            return Err(TsError::Parser("bit reader exhausted".into()));
        }

        let mut value = 0u32;
        let mut left = n;
        while left > 0 {
            if self.bit_offset == 0 && left >= 8 {
                value = (value << 8) | self.data[self.byte_offset] as u32;
                self.byte_offset += 1;
                left -= 8;
            } else {
                value = (value << 1) | self.read_bit()? as u32;
                left -= 1;
            }
        }

        Ok(value)
    }

    /// Returns the next `n` bits without consuming them.
    pub fn peek_bits(&self, n: u32) -> Result<u32> {
        let mut copy = BitReader {
            data: self.data,
            byte_offset: self.byte_offset,
            bit_offset: self.bit_offset,
        };
        copy.read_bits(n)
    }

    pub fn skip_bits(&mut self, n: u32) -> Result<()> {
        let n = n as usize;
        if n > self.available_bits() {
            return Err(TsError::Parser("skip past end of data".into()));
        }
        let absolute = self.position() + n;
        self.byte_offset = absolute / 8;
        self.bit_offset = (absolute % 8) as u8;
        Ok(())
    }

    /// Skips the rest of the current byte, if any.
    pub fn align_byte(&mut self) {
        if self.bit_offset != 0 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
    }

    /// Bit position from the start of the slice.
    pub fn position(&self) -> usize {
        self.byte_offset * 8 + self.bit_offset as usize
    }

    pub fn available_bits(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.position())
    }
}
