use super::{Ac3Parser, Mp3Parser};
use log::debug;
use std::time::Duration;

/// Audio parser behind a [`ShoutcastFilter`].
pub enum AudioParser {
    Mp3(Mp3Parser),
    Ac3(Ac3Parser),
}

impl AudioParser {
    pub fn process_data(&mut self, data: &[u8]) {
        match self {
            AudioParser::Mp3(p) => p.process_data(data),
            AudioParser::Ac3(p) => p.process_data(data),
        }
    }

    pub fn set_position(&mut self, position: Duration) {
        match self {
            AudioParser::Mp3(p) => p.set_position(position),
            AudioParser::Ac3(p) => p.set_position(position),
        }
    }

    pub fn frames(&self) -> u64 {
        match self {
            AudioParser::Mp3(p) => p.frames(),
            AudioParser::Ac3(p) => p.frames(),
        }
    }

    pub fn flush(&mut self) {
        match self {
            AudioParser::Mp3(p) => p.flush(),
            AudioParser::Ac3(p) => p.flush(),
        }
    }

    pub fn end_of_stream(&mut self) {
        match self {
            AudioParser::Mp3(p) => p.end_of_stream(),
            AudioParser::Ac3(p) => p.end_of_stream(),
        }
    }
}

/// One decoded ICY metadata block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShoutcastMetadata {
    /// The `StreamTitle` tag, when present and non-empty.
    pub title: Option<String>,
    /// Every `key`/`value` pair in block order, `StreamTitle` included.
    pub tags: Vec<(String, String)>,
}

impl ShoutcastMetadata {
    /// Decodes a metadata block, trimming its NUL padding.
    ///
    /// Blocks are normally `key='value';` sequences. Values may contain
    /// quotes, so when the strict form does not parse the block is scanned
    /// for every `key='` opener instead.
    pub fn parse(block: &[u8]) -> Self {
        let text = decode_text(block);
        let tags = parse_strict(&text).unwrap_or_else(|| parse_scan(&text));
        let title = tags
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("StreamTitle"))
            .map(|(_, value)| value.clone())
            .filter(|value| !value.is_empty());
        ShoutcastMetadata { title, tags }
    }
}

/// Receives metadata blocks stripped out of a Shoutcast stream.
pub trait MetadataSink: Send {
    fn report(&mut self, metadata: &ShoutcastMetadata);
}

enum FilterState {
    Audio { remaining: usize },
    Length,
    Metadata { remaining: usize },
}

/// Strips ICY metadata out of a raw Shoutcast audio stream.
///
/// Every `interval` audio bytes the server inserts one length byte followed
/// by `length * 16` bytes of metadata. Audio bytes go to the wrapped parser
/// untouched; metadata blocks are decoded and reported when their text
/// changes. An interval of zero disables stripping.
pub struct ShoutcastFilter {
    parser: AudioParser,
    metadata_sink: Option<Box<dyn MetadataSink>>,
    interval: usize,
    state: FilterState,
    block: Vec<u8>,
    last_block: Vec<u8>,
}

impl ShoutcastFilter {
    pub fn new(parser: AudioParser, interval: usize, metadata_sink: Option<Box<dyn MetadataSink>>) -> Self {
        Self {
            parser,
            metadata_sink,
            interval,
            state: FilterState::Audio { remaining: interval },
            block: Vec::new(),
            last_block: Vec::new(),
        }
    }

    pub fn parser(&self) -> &AudioParser {
        &self.parser
    }

    pub fn parser_mut(&mut self) -> &mut AudioParser {
        &mut self.parser
    }

    pub fn process_data(&mut self, data: &[u8]) {
        if self.interval == 0 {
            self.parser.process_data(data);
            return;
        }

        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                FilterState::Audio { remaining } => {
                    let take = remaining.min(data.len() - pos);
                    self.parser.process_data(&data[pos..pos + take]);
                    pos += take;
                    self.state = if take == remaining {
                        FilterState::Length
                    } else {
                        FilterState::Audio {
                            remaining: remaining - take,
                        }
                    };
                }
                FilterState::Length => {
                    let length = data[pos] as usize * 16;
                    pos += 1;
                    self.block.clear();
                    self.state = if length == 0 {
                        FilterState::Audio {
                            remaining: self.interval,
                        }
                    } else {
                        FilterState::Metadata { remaining: length }
                    };
                }
                FilterState::Metadata { remaining } => {
                    let take = remaining.min(data.len() - pos);
                    self.block.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if take == remaining {
                        self.finish_block();
                        self.state = FilterState::Audio {
                            remaining: self.interval,
                        };
                    } else {
                        self.state = FilterState::Metadata {
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }
    }

    fn finish_block(&mut self) {
        if self.block == self.last_block {
            return;
        }
        std::mem::swap(&mut self.block, &mut self.last_block);
        self.block.clear();

        let metadata = ShoutcastMetadata::parse(&self.last_block);
        debug!("shoutcast metadata: {:?}", metadata.title);
        if let Some(sink) = self.metadata_sink.as_mut() {
            sink.report(&metadata);
        }
    }

    /// Drops partial frame and metadata state; the next byte is treated as
    /// the start of a metadata interval.
    pub fn flush(&mut self) {
        self.parser.flush();
        self.block.clear();
        self.state = FilterState::Audio {
            remaining: self.interval,
        };
    }

    pub fn end_of_stream(&mut self) {
        self.parser.end_of_stream();
    }
}

fn decode_text(block: &[u8]) -> String {
    let end = block.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let bytes = &block[..end];
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        // Latin-1 maps every byte to the code point of the same value.
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn parse_strict(text: &str) -> Option<Vec<(String, String)>> {
    let mut tags = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let eq = rest.find("='")?;
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(|c: char| c == '\'' || c == ';' || c.is_whitespace()) {
            return None;
        }
        let tail = &rest[eq + 2..];
        let (value, next) = match tail.find("';") {
            Some(end) => (&tail[..end], &tail[end + 2..]),
            None => (tail.strip_suffix('\'')?, ""),
        };
        tags.push((key.to_string(), value.to_string()));
        rest = next.trim_start();
    }
    Some(tags)
}

fn parse_scan(text: &str) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    let mut search = 0;
    while let Some(found) = text[search..].find("='") {
        let eq = search + found;
        let key_start = text[..eq]
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
            .last()
            .map_or(eq, |(i, _)| i);
        let value_start = eq + 2;
        let value_end = text[value_start..].find('\'').map_or(text.len(), |i| value_start + i);
        if key_start < eq {
            tags.push((text[key_start..eq].to_string(), text[value_start..value_end].to_string()));
        }
        search = value_end;
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::RecordingSink;
    use crate::codec::FrameHeader;
    use crate::codec::Mp3Header;
    use crate::pool::PacketPool;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const HEADER_128K: [u8; 4] = [0xFF, 0xFB, 0x90, 0x40];

    #[derive(Clone, Default)]
    struct Reports(Arc<Mutex<Vec<ShoutcastMetadata>>>);

    impl MetadataSink for Reports {
        fn report(&mut self, metadata: &ShoutcastMetadata) {
            self.0.lock().push(metadata.clone());
        }
    }

    fn mp3_frames(count: usize) -> Vec<u8> {
        let length = Mp3Header::parse(&HEADER_128K).unwrap().frame_length();
        let mut data = Vec::new();
        for i in 0..count {
            data.extend_from_slice(&HEADER_128K);
            data.resize(data.len() + length - 4, i as u8 + 1);
        }
        data
    }

    fn metadata_block(text: &str) -> Vec<u8> {
        let blocks = text.len().div_ceil(16);
        let mut block = vec![blocks as u8];
        block.extend_from_slice(text.as_bytes());
        block.resize(1 + blocks * 16, 0);
        block
    }

    /// Inserts `metadata` after every `interval` bytes of `audio`.
    fn interleave(audio: &[u8], interval: usize, metadata: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, chunk) in audio.chunks(interval).enumerate() {
            out.extend_from_slice(chunk);
            if chunk.len() == interval {
                out.extend_from_slice(&metadata[i % metadata.len()]);
            }
        }
        out
    }

    #[test]
    fn test_parse_strict_pairs() {
        let metadata = ShoutcastMetadata::parse(b"StreamTitle='Artist - Don't Stop';StreamUrl='http://x';\0\0\0");
        assert_eq!(metadata.title.as_deref(), Some("Artist - Don't Stop"));
        assert_eq!(
            metadata.tags,
            vec![
                ("StreamTitle".to_string(), "Artist - Don't Stop".to_string()),
                ("StreamUrl".to_string(), "http://x".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_falls_back_to_scan() {
        let metadata = ShoutcastMetadata::parse(b"junk StreamTitle='Song' more StreamUrl='u'");
        assert_eq!(metadata.title.as_deref(), Some("Song"));
        assert_eq!(metadata.tags.len(), 2);
        assert_eq!(metadata.tags[1], ("StreamUrl".to_string(), "u".to_string()));
    }

    #[test]
    fn test_parse_latin1_fallback() {
        let metadata = ShoutcastMetadata::parse(b"StreamTitle='Caf\xe9';");
        assert_eq!(metadata.title.as_deref(), Some("Café"));
    }

    #[test]
    fn test_empty_title_is_none() {
        let metadata = ShoutcastMetadata::parse(b"StreamTitle='';");
        assert_eq!(metadata.title, None);
        assert_eq!(metadata.tags.len(), 1);
    }

    #[test]
    fn test_metadata_stripped_from_audio() {
        let sink = RecordingSink::default();
        let reports = Reports::default();
        let parser = AudioParser::Mp3(Mp3Parser::new(PacketPool::default(), Box::new(sink.clone())));
        let mut filter = ShoutcastFilter::new(parser, 300, Some(Box::new(reports.clone())));

        let audio = mp3_frames(4);
        let stream = interleave(
            &audio,
            300,
            &[
                metadata_block("StreamTitle='One';"),
                vec![0],
                metadata_block("StreamTitle='One';"),
                metadata_block("StreamTitle='Two';"),
            ],
        );
        for chunk in stream.chunks(7) {
            filter.process_data(chunk);
        }

        let frames: Vec<u8> = sink.packets().into_iter().flat_map(|p| p.data).collect();
        assert_eq!(frames, audio);
        assert_eq!(filter.parser().frames(), 4);

        // A block identical to the previous one is not reported again.
        let titles: Vec<_> = reports.0.lock().iter().map(|m| m.title.clone()).collect();
        assert_eq!(
            titles,
            vec![Some("One".to_string()), Some("Two".to_string()), Some("One".to_string())]
        );
    }

    #[test]
    fn test_zero_interval_passes_through() {
        let sink = RecordingSink::default();
        let parser = AudioParser::Mp3(Mp3Parser::new(PacketPool::default(), Box::new(sink.clone())));
        let mut filter = ShoutcastFilter::new(parser, 0, None);
        filter.process_data(&mp3_frames(2));
        filter.end_of_stream();
        assert_eq!(sink.packets().len(), 2);
        assert_eq!(sink.ended(), 1);
    }
}
