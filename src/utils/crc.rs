/// CRC32 implementation specifically for MPEG-2 TS PSI sections
/// Based on ITU-T H.222.0 / ISO/IEC 13818-1 Annex A
/// Polynomial: x32 + x26 + x23 + x22 + x16 + x12 + x11 + x10 + x8 + x7 + x5 + x4 + x2 + x + 1
/// Initial value: 0xFFFFFFFF, MSB first, no final xor

const CRC32_MPEG2: u32 = 0x04C11DB7;

/// MPEG-2 CRC32 calculator used to validate PAT/PMT sections.
///
/// Running the calculation over a whole section, trailing `CRC_32` field
/// included, yields zero for an intact section.
pub struct Crc32Mpeg2 {
    table: [u32; 256],
}

impl Crc32Mpeg2 {
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let mut crc = (i as u32) << 24;
            for _ in 0..8 {
                crc = if (crc & 0x80000000) != 0 {
                    (crc << 1) ^ CRC32_MPEG2
                } else {
                    crc << 1
                };
            }
            *slot = crc;
        }
        Self { table }
    }

    /// Calculates the checksum of `data`.
    ///
    /// ```
    /// use tsdemux::utils::Crc32Mpeg2;
    ///
    /// let crc = Crc32Mpeg2::new();
    /// assert_eq!(crc.calculate(&[0x01, 0x01]), 0xD66FB816);
    /// ```
    pub fn calculate(&self, data: &[u8]) -> u32 {
        let mut crc = 0xFFFFFFFF;
        for &byte in data {
            let index = ((crc >> 24) ^ (byte as u32)) & 0xFF;
            crc = (crc << 8) ^ self.table[index as usize];
        }
        crc
    }

    /// True when `section` ends with a matching big-endian `CRC_32`.
    pub fn verify(&self, section: &[u8]) -> bool {
        section.len() >= 4 && self.calculate(section) == 0
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}
