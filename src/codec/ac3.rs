use super::frame::{AudioFrameParser, FrameHeader};
use super::{AudioCodec, AudioConfig};
use crate::error::{Result, TsError};
use crate::utils::BitReader;
use std::time::Duration;

/// AC-3 (Dolby Digital) frame parser.
pub type Ac3Parser = AudioFrameParser<Ac3Header>;

/// Every AC-3 frame carries 1536 samples; at 48 kHz that is 32 ms, and the
/// same nominal duration is used for all sample rates.
pub const AC3_FRAME_DURATION: Duration = Duration::from_millis(32);

// Nominal bitrates in kbit/s, indexed by frmsizecod / 2
const BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

const SAMPLE_RATES: [u32; 3] = [48000, 44100, 32000];

// Full-bandwidth channels per acmod
const CHANNELS: [u8; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// The `syncinfo` and leading `bsi` fields of an AC-3 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ac3Header {
    pub fscod: u8,
    pub frmsizecod: u8,
    pub bsid: u8,
    pub bsmod: u8,
    pub acmod: u8,
    pub lfe: bool,
    pub sample_rate: u32,
    /// Bits per second.
    pub bitrate: u32,
}

impl Ac3Header {
    /// Frame size in 16-bit words.
    pub fn words(&self) -> usize {
        let kbps = BITRATES[(self.frmsizecod / 2) as usize];
        let mut words = kbps * 96_000 / self.sample_rate;
        // 44.1 kHz frames alternate between two sizes.
        if self.fscod == 1 && self.frmsizecod & 1 == 1 {
            words += 1;
        }
        words as usize
    }

    pub fn channels(&self) -> u8 {
        CHANNELS[self.acmod as usize] + self.lfe as u8
    }
}

impl FrameHeader for Ac3Header {
    const HEADER_LENGTH: usize = 7;

    fn is_first_sync_byte(byte: u8) -> bool {
        byte == 0x0B
    }

    fn is_second_sync_byte(_first: u8, byte: u8) -> bool {
        byte == 0x77
    }

    fn parse(header: &[u8]) -> Result<Self> {
        let mut reader = BitReader::new(header);
        if reader.read_bits(16)? != 0x0B77 {
            return Err(TsError::Parser("invalid AC-3 sync word".into()));
        }
        reader.skip_bits(16)?; // crc1

        let fscod = reader.read_bits(2)? as u8;
        if fscod == 3 {
            return Err(TsError::Parser("reserved AC-3 sample rate code".into()));
        }
        let frmsizecod = reader.read_bits(6)? as u8;
        if frmsizecod > 37 {
            return Err(TsError::Parser(format!("invalid frmsizecod {}", frmsizecod)));
        }
        let bsid = reader.read_bits(5)? as u8;
        if bsid > 10 {
            return Err(TsError::Parser(format!("unsupported bsid {}", bsid)));
        }
        let bsmod = reader.read_bits(3)? as u8;
        let acmod = reader.read_bits(3)? as u8;

        if (acmod & 0x1) != 0 && acmod != 0x1 {
            reader.skip_bits(2)?; // cmixlev
        }
        if (acmod & 0x4) != 0 {
            reader.skip_bits(2)?; // surmixlev
        }
        if acmod == 0x2 {
            reader.skip_bits(2)?; // dsurmod
        }
        let lfe = reader.read_bit()?;

        Ok(Ac3Header {
            fscod,
            frmsizecod,
            bsid,
            bsmod,
            acmod,
            lfe,
            sample_rate: SAMPLE_RATES[fscod as usize],
            bitrate: BITRATES[(frmsizecod / 2) as usize] * 1000,
        })
    }

    fn frame_length(&self) -> usize {
        self.words() * 2
    }

    fn duration(&self) -> Duration {
        AC3_FRAME_DURATION
    }

    fn config(&self) -> AudioConfig {
        AudioConfig {
            codec: AudioCodec::Ac3,
            sample_rate: self.sample_rate,
            channels: self.channels(),
            bitrate: self.bitrate,
            frame_duration: AC3_FRAME_DURATION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::RecordingSink;
    use crate::codec::{StreamConfig, StreamHandler, StreamHandlerKind};
    use crate::config::DemuxerConfig;
    use crate::pool::PacketPool;
    use pretty_assertions::assert_eq;

    /// 48 kHz, 64 kbit/s (frmsizecod 8), bsid 8, stereo with dsurmod, no LFE.
    const HEADER_64K: [u8; 7] = [0x0B, 0x77, 0x00, 0x00, 0x08, 0x40, 0x40];

    fn frame(header: [u8; 7], fill: u8) -> Vec<u8> {
        let length = Ac3Header::parse(&header).unwrap().frame_length();
        let mut frame = header.to_vec();
        frame.resize(length, fill);
        frame
    }

    fn parser() -> (Ac3Parser, RecordingSink) {
        let sink = RecordingSink::default();
        (Ac3Parser::new(PacketPool::default(), Box::new(sink.clone())), sink)
    }

    #[test]
    fn test_parse_header() {
        let header = Ac3Header::parse(&HEADER_64K).unwrap();
        assert_eq!(header.sample_rate, 48_000);
        assert_eq!(header.bitrate, 64_000);
        assert_eq!(header.acmod, 2);
        assert!(!header.lfe);
        assert_eq!(header.channels(), 2);
        assert_eq!(header.frame_length(), 256);
    }

    #[test]
    fn test_frame_sizes() {
        // 44.1 kHz, frmsizecod 0 / 1: 69 / 70 words
        let even = Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0x40, 0x40, 0x40]).unwrap();
        let odd = Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0x41, 0x40, 0x40]).unwrap();
        assert_eq!(even.words(), 69);
        assert_eq!(odd.words(), 70);
        // 32 kHz 640 kbit/s: 1920 words
        let max = Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0x80 | 37, 0x40, 0x40]).unwrap();
        assert_eq!(max.frame_length(), 3840);
    }

    #[test]
    fn test_lfe_after_mix_levels() {
        // acmod 7 (3/2): cmixlev and surmixlev precede lfeon
        // byte6: 111 01 10 1 -> acmod 7, cmixlev 1, surmixlev 2, lfeon 1
        let header = Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0x08, 0x40, 0b1110_1101]).unwrap();
        assert_eq!(header.acmod, 7);
        assert!(header.lfe);
        assert_eq!(header.channels(), 6);

        // acmod 1 (mono): lfeon follows acmod directly
        let header = Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0x08, 0x40, 0b0011_0000]).unwrap();
        assert_eq!(header.acmod, 1);
        assert!(header.lfe);
        assert_eq!(header.channels(), 2);
    }

    #[test]
    fn test_rejects_invalid_fields() {
        // fscod 3
        assert!(Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0xC8, 0x40, 0x40]).is_err());
        // frmsizecod 38
        assert!(Ac3Header::parse(&[0x0B, 0x77, 0, 0, 38, 0x40, 0x40]).is_err());
        // bsid 16 (E-AC-3)
        assert!(Ac3Header::parse(&[0x0B, 0x77, 0, 0, 0x08, 0x80, 0x40]).is_err());
    }

    #[test]
    fn test_frames_get_fixed_duration() {
        let (mut parser, sink) = parser();
        parser.set_pending_timestamp(Some(Duration::from_millis(100)));
        let mut data = vec![0x00, 0x0B, 0x00];
        for fill in [1, 2, 3] {
            data.extend(frame(HEADER_64K, fill));
        }
        parser.process_data(&data);

        let packets = sink.packets();
        assert_eq!(packets.len(), 3);
        let pts: Vec<_> = packets.iter().map(|p| p.pts.unwrap().as_millis()).collect();
        assert_eq!(pts, vec![100, 132, 164]);
        assert!(packets.iter().all(|p| p.duration == Some(AC3_FRAME_DURATION) && p.data.len() == 256));
        assert_eq!(
            sink.configs(),
            vec![StreamConfig::Audio(AudioConfig {
                codec: AudioCodec::Ac3,
                sample_rate: 48_000,
                channels: 2,
                bitrate: 64_000,
                frame_duration: AC3_FRAME_DURATION,
            })]
        );
    }

    #[test]
    fn test_corrupt_header_recovers_next_frame() {
        let (mut parser, sink) = parser();
        let mut first = frame(HEADER_64K, 0x55);
        first[4] = 0xC8; // fscod 3
        let second = frame(HEADER_64K, 0x66);
        let mut data = first;
        data.extend(&second);
        parser.process_data(&data);

        let packets = sink.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, second);
    }

    #[test]
    fn test_resync_inside_rejected_header() {
        let (mut parser, sink) = parser();
        // A stray sync word directly before the real frame. The bogus header
        // window reads the real frame's crc1 as fscod 3 and is rejected; the
        // real sync two bytes into that window must be picked up.
        let mut real = frame(HEADER_64K, 0x21);
        real[2] = 0xC0;
        let mut data = vec![0x0B, 0x77];
        data.extend(&real);
        parser.process_data(&data);

        let packets = sink.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, real);
        assert_eq!(parser.rejected_headers(), 1);
    }

    #[test]
    fn test_frame_grows_working_buffer() {
        let (mut parser, sink) = parser();
        let big = frame([0x0B, 0x77, 0, 0, 0x80 | 37, 0x40, 0x40], 0x99);
        assert!(big.len() > 512);
        parser.process_data(&big[..100]);
        parser.process_data(&big[100..]);
        assert_eq!(sink.packets()[0].data, big);
    }

    #[test]
    fn test_handler_enum_keeps_parser_state() {
        let sink = RecordingSink::default();
        let mut handler = StreamHandler::new(
            StreamHandlerKind::Ac3,
            0x81,
            PacketPool::default(),
            Box::new(sink.clone()),
            &DemuxerConfig::default(),
        );
        let f = frame(HEADER_64K, 0x31);
        handler.start_unit(Some(Duration::from_secs(1)), None);
        handler.data(&f[..3]);
        handler.end_unit();
        handler.start_unit(None, None);
        handler.data(&f[3..]);
        assert_eq!(sink.packets().len(), 1);
        assert_eq!(sink.packets()[0].pts, Some(Duration::from_secs(1)));

        handler.end_of_stream();
        assert_eq!(sink.ended(), 1);
    }
}
