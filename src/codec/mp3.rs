use super::frame::{AudioFrameParser, FrameHeader};
use super::{AudioCodec, AudioConfig};
use crate::error::{Result, TsError};
use crate::utils::BitReader;
use std::time::Duration;

/// MPEG audio frame parser (layers I-III, MPEG-1/2/2.5).
pub type Mp3Parser = AudioFrameParser<Mp3Header>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    V1,
    V2,
    V25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegLayer {
    I,
    II,
    III,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Stereo,
    JointStereo,
    DualChannel,
    Mono,
}

// Bitrates in kbit/s for bitrate_index 1..=14
const BITRATES_V1_L1: [u32; 14] = [32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATES_V25: [u32; 3] = [11025, 12000, 8000];

/// The 32-bit MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp3Header {
    pub version: MpegVersion,
    pub layer: MpegLayer,
    pub protected: bool,
    /// Bits per second.
    pub bitrate: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channel_mode: ChannelMode,
}

impl Mp3Header {
    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (MpegLayer::I, _) => 384,
            (MpegLayer::II, _) => 1152,
            (MpegLayer::III, MpegVersion::V1) => 1152,
            (MpegLayer::III, _) => 576,
        }
    }

    pub fn channels(&self) -> u8 {
        match self.channel_mode {
            ChannelMode::Mono => 1,
            _ => 2,
        }
    }
}

impl FrameHeader for Mp3Header {
    const HEADER_LENGTH: usize = 4;

    fn is_first_sync_byte(byte: u8) -> bool {
        byte == 0xFF
    }

    fn is_second_sync_byte(_first: u8, byte: u8) -> bool {
        (byte & 0xE0) == 0xE0
    }

    fn parse(header: &[u8]) -> Result<Self> {
        let mut reader = BitReader::new(header);
        if reader.read_bits(11)? != 0x7FF {
            return Err(TsError::Parser("invalid MPEG audio sync".into()));
        }

        let version = match reader.read_bits(2)? {
            0 => MpegVersion::V25,
            2 => MpegVersion::V2,
            3 => MpegVersion::V1,
            _ => return Err(TsError::Parser("reserved MPEG audio version".into())),
        };
        let layer = match reader.read_bits(2)? {
            1 => MpegLayer::III,
            2 => MpegLayer::II,
            3 => MpegLayer::I,
            _ => return Err(TsError::Parser("reserved MPEG audio layer".into())),
        };
        let protected = !reader.read_bit()?;

        let bitrate_index = reader.read_bits(4)? as usize;
        if bitrate_index == 0 || bitrate_index == 15 {
            return Err(TsError::Parser(format!("unsupported bitrate index {}", bitrate_index)));
        }
        let table = match (version, layer) {
            (MpegVersion::V1, MpegLayer::I) => &BITRATES_V1_L1,
            (MpegVersion::V1, MpegLayer::II) => &BITRATES_V1_L2,
            (MpegVersion::V1, MpegLayer::III) => &BITRATES_V1_L3,
            (_, MpegLayer::I) => &BITRATES_V2_L1,
            (_, _) => &BITRATES_V2_L23,
        };
        let bitrate = table[bitrate_index - 1] * 1000;

        let sample_rate_index = reader.read_bits(2)? as usize;
        if sample_rate_index == 3 {
            return Err(TsError::Parser("reserved sample rate index".into()));
        }
        let sample_rate = match version {
            MpegVersion::V1 => SAMPLE_RATES_V1[sample_rate_index],
            MpegVersion::V2 => SAMPLE_RATES_V2[sample_rate_index],
            MpegVersion::V25 => SAMPLE_RATES_V25[sample_rate_index],
        };

        let padding = reader.read_bit()?;
        reader.skip_bits(1)?; // private bit
        let channel_mode = match reader.read_bits(2)? {
            0 => ChannelMode::Stereo,
            1 => ChannelMode::JointStereo,
            2 => ChannelMode::DualChannel,
            _ => ChannelMode::Mono,
        };

        Ok(Mp3Header {
            version,
            layer,
            protected,
            bitrate,
            sample_rate,
            padding,
            channel_mode,
        })
    }

    fn frame_length(&self) -> usize {
        let pad = self.padding as u32;
        let length = match (self.layer, self.version) {
            (MpegLayer::I, _) => (12 * self.bitrate / self.sample_rate + pad) * 4,
            (MpegLayer::II, _) | (MpegLayer::III, MpegVersion::V1) => 144 * self.bitrate / self.sample_rate + pad,
            (MpegLayer::III, _) => 72 * self.bitrate / self.sample_rate + pad,
        };
        length as usize
    }

    fn duration(&self) -> Duration {
        Duration::from_nanos(self.samples_per_frame() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    fn config(&self) -> AudioConfig {
        AudioConfig {
            codec: AudioCodec::Mp3,
            sample_rate: self.sample_rate,
            channels: self.channels(),
            bitrate: self.bitrate,
            frame_duration: self.duration(),
        }
    }
}
