#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tsdemux::buffering::{BufferingManager, NextPacket, QueueThrottle, StreamBuffer};
    use tsdemux::codec::{AudioCodec, PacketSink, StreamConfig};
    use tsdemux::config::BufferingConfig;
    use tsdemux::format::ts::{
        pat_section, pmt_section, PesHeader, PmtStreamSpec, TsDemuxer, TsPacketizer, PID_PAT, STREAM_TYPE_AC3,
        STREAM_TYPE_H264, STREAM_TYPE_MPEG1_AUDIO,
    };
    use tsdemux::pool::{PacketPool, PesPacket};

    const PMT_PID: u16 = 0x1000;
    const VIDEO_PID: u16 = 0x100;
    const AC3_PID: u16 = 0x101;
    const MP3_PID: u16 = 0x102;

    // 48 kHz, 64 kbit/s AC-3: 256 bytes, 32 ms.
    const AC3_HEADER: [u8; 7] = [0x0B, 0x77, 0x00, 0x00, 0x08, 0x40, 0x40];
    const AC3_FRAME_LENGTH: usize = 256;
    // MPEG-1 Layer III, 128 kbit/s, 44.1 kHz: 417 bytes.
    const MP3_HEADER: [u8; 4] = [0xFF, 0xFB, 0x90, 0x40];
    const MP3_FRAME_LENGTH: usize = 417;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Captured {
        data: Vec<u8>,
        pts: Option<Duration>,
        duration: Option<Duration>,
    }

    #[derive(Debug, Default, PartialEq)]
    struct Capture {
        configs: Vec<StreamConfig>,
        packets: Vec<Captured>,
        ended: usize,
    }

    type Captures = Arc<Mutex<BTreeMap<u16, Capture>>>;

    /// Copies every packet it is given into a shared map keyed by PID.
    struct CaptureSink {
        pid: u16,
        pool: PacketPool,
        captures: Captures,
    }

    impl PacketSink for CaptureSink {
        fn configure(&mut self, config: StreamConfig) {
            self.captures.lock().entry(self.pid).or_default().configs.push(config);
        }

        fn submit(&mut self, packet: PesPacket) {
            self.captures.lock().entry(self.pid).or_default().packets.push(Captured {
                data: packet.data().to_vec(),
                pts: packet.pts,
                duration: packet.duration,
            });
            self.pool.free(packet);
        }

        fn end_of_stream(&mut self) {
            self.captures.lock().entry(self.pid).or_default().ended += 1;
        }
    }

    fn capturing_demuxer() -> (TsDemuxer, Captures) {
        let captures: Captures = Arc::default();
        let factory_captures = captures.clone();
        let pool = PacketPool::default();
        let factory_pool = pool.clone();
        let demuxer = TsDemuxer::builder()
            .pool(pool)
            .sink_factory(move |stream| {
                Some(Box::new(CaptureSink {
                    pid: stream.pid,
                    pool: factory_pool.clone(),
                    captures: factory_captures.clone(),
                }) as Box<dyn PacketSink>)
            })
            .build()
            .unwrap();
        (demuxer, captures)
    }

    fn ac3_frame(fill: u8) -> Vec<u8> {
        let mut frame = AC3_HEADER.to_vec();
        frame.resize(AC3_FRAME_LENGTH, fill);
        frame
    }

    fn mp3_frame(fill: u8) -> Vec<u8> {
        let mut frame = MP3_HEADER.to_vec();
        frame.resize(MP3_FRAME_LENGTH, fill);
        frame
    }

    fn pes(stream_id: u8, pts: Duration, payload: &[u8], bounded: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PesHeader::new(stream_id).with_pts(pts).write_to(&mut buf);
        if bounded {
            let length = (buf.len() - 6 + payload.len()) as u16;
            buf[4..6].copy_from_slice(&length.to_be_bytes());
        }
        buf.put_slice(payload);
        buf.to_vec()
    }

    /// Transport stream under construction.
    #[derive(Default)]
    struct Stream {
        packetizer: TsPacketizer,
        bytes: Vec<u8>,
    }

    impl Stream {
        fn section(&mut self, pid: u16, section: &[u8]) -> &mut Self {
            for packet in self.packetizer.section_packets(pid, section) {
                self.bytes.extend(packet);
            }
            self
        }

        fn pes(&mut self, pid: u16, unit: &[u8]) -> &mut Self {
            for packet in self.packetizer.pes_packets(pid, unit) {
                self.bytes.extend(packet);
            }
            self
        }

        fn take(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.bytes)
        }
    }

    fn program() -> Vec<PmtStreamSpec> {
        vec![
            PmtStreamSpec::new(STREAM_TYPE_H264, VIDEO_PID),
            PmtStreamSpec::new(STREAM_TYPE_AC3, AC3_PID).language("eng"),
            PmtStreamSpec::new(STREAM_TYPE_MPEG1_AUDIO, MP3_PID).language("deu"),
        ]
    }

    /// A few seconds of interleaved video, AC-3 and MP3 with PSI repeated
    /// mid-stream.
    fn sample_stream() -> Vec<u8> {
        let mut stream = Stream::default();
        stream
            .section(PID_PAT, &pat_section(1, 0, 0, 0, &[(1, PMT_PID)]))
            .section(PMT_PID, &pmt_section(1, 0, VIDEO_PID, &program()));

        for unit in 0..12u8 {
            let base = Duration::from_millis(unit as u64 * 160);
            let ac3: Vec<u8> = (0..5).flat_map(|i| ac3_frame(unit * 5 + i)).collect();
            let mp3: Vec<u8> = (0..6).flat_map(|i| mp3_frame(unit * 6 + i)).collect();
            let video = vec![unit; 700 + unit as usize * 37];
            stream
                .pes(VIDEO_PID, &pes(0xE0, base, &video, false))
                .pes(AC3_PID, &pes(0xBD, base, &ac3, true))
                .pes(MP3_PID, &pes(0xC0, base, &mp3, true));
            if unit % 4 == 3 {
                stream
                    .section(PID_PAT, &pat_section(1, 0, 0, 0, &[(1, PMT_PID)]))
                    .section(PMT_PID, &pmt_section(1, 0, VIDEO_PID, &program()));
            }
        }
        stream.take()
    }

    fn demux_in_chunks(input: &[u8], mut chunk_size: impl FnMut() -> usize) -> BTreeMap<u16, Capture> {
        let (mut demuxer, captures) = capturing_demuxer();
        let mut pos = 0;
        while pos < input.len() {
            let end = pos + chunk_size().clamp(1, input.len() - pos);
            demuxer.process_data(&input[pos..end]);
            pos = end;
        }
        demuxer.process_end_of_data();
        assert_eq!(demuxer.pool().stats().outstanding, 0);
        let taken = std::mem::take(&mut *captures.lock());
        taken
    }

    #[test]
    fn test_end_to_end_output() {
        let captures = demux_in_chunks(&sample_stream(), || usize::MAX);

        let ac3 = &captures[&AC3_PID];
        assert_eq!(ac3.packets.len(), 60);
        assert_eq!(ac3.ended, 1);
        match &ac3.configs[..] {
            [StreamConfig::Audio(config)] => {
                assert_eq!(config.codec, AudioCodec::Ac3);
                assert_eq!(config.sample_rate, 48_000);
                assert_eq!(config.bitrate, 64_000);
            }
            other => panic!("unexpected configs {:?}", other),
        }
        for (i, packet) in ac3.packets.iter().enumerate() {
            assert_eq!(packet.data, ac3_frame(i as u8));
            assert_eq!(packet.pts, Some(Duration::from_millis(i as u64 * 32)));
            assert_eq!(packet.duration, Some(Duration::from_millis(32)));
        }

        let mp3 = &captures[&MP3_PID];
        assert_eq!(mp3.packets.len(), 72);
        assert!(mp3.packets.iter().enumerate().all(|(i, p)| p.data == mp3_frame(i as u8)));
        // Each unit restamps its first frame.
        assert_eq!(mp3.packets[6].pts, Some(Duration::from_millis(160)));

        let video = &captures[&VIDEO_PID];
        assert_eq!(video.configs, vec![StreamConfig::Elementary { stream_type: STREAM_TYPE_H264 }]);
        assert_eq!(video.packets.len(), 12);
        assert_eq!(video.packets[11].data, vec![11u8; 700 + 11 * 37]);
        assert_eq!(video.packets[11].pts, Some(Duration::from_millis(11 * 160)));
    }

    #[quickcheck]
    fn prop_chunking_does_not_change_output(seed: u64, limit: u8) -> bool {
        let input = sample_stream();
        let expected = demux_in_chunks(&input, || usize::MAX);

        let max_chunk = match limit % 5 {
            0 => 1,
            1 => 7,
            2 => 188,
            3 => 1_000,
            _ => 65_536,
        };
        let mut state = seed | 1;
        let actual = demux_in_chunks(&input, || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as usize % max_chunk + 1
        });
        actual == expected
    }

    #[test]
    fn test_garbage_before_stream_is_skipped() {
        let mut input = vec![0x47, 0x00, 0x12, 0x47, 0x99];
        input.extend(sample_stream());
        let whole = demux_in_chunks(&input, || usize::MAX);
        assert_eq!(whole[&AC3_PID].packets.len(), 60);
        for size in [1, 7, 4096] {
            let captures = demux_in_chunks(&input, || size);
            assert_eq!(captures, whole, "chunk size {}", size);
        }
    }

    #[test]
    fn test_out_of_order_sections_do_not_activate() {
        let (mut demuxer, _captures) = capturing_demuxer();
        let mut stream = Stream::default();

        let first = pat_section(1, 0, 0, 1, &[(1, PMT_PID)]);
        let second = pat_section(1, 0, 1, 1, &[(2, 0x1100)]);
        stream.section(PID_PAT, &second).section(PID_PAT, &first);
        demuxer.process_data(&stream.take());
        assert!(demuxer.programs().is_empty());

        stream.section(PID_PAT, &second);
        demuxer.process_data(&stream.take());
        assert_eq!(demuxer.programs(), vec![1, 2]);
        assert_eq!(demuxer.stats().pat_versions, 1);
    }

    #[test]
    fn test_crc_mismatch_keeps_program_set() {
        let (mut demuxer, _captures) = capturing_demuxer();
        let mut stream = Stream::default();
        stream
            .section(PID_PAT, &pat_section(1, 0, 0, 0, &[(1, PMT_PID)]))
            .section(PMT_PID, &pmt_section(1, 0, VIDEO_PID, &program()));
        demuxer.process_data(&stream.take());
        assert_eq!(demuxer.stream_pids(), vec![VIDEO_PID, AC3_PID, MP3_PID]);

        let mut corrupt = pat_section(1, 1, 0, 0, &[(2, 0x1100)]);
        corrupt[9] ^= 0x01;
        stream.section(PID_PAT, &corrupt);
        demuxer.process_data(&stream.take());

        assert_eq!(demuxer.programs(), vec![1]);
        assert_eq!(demuxer.stream_pids(), vec![VIDEO_PID, AC3_PID, MP3_PID]);
        assert_eq!(demuxer.stats().rejected_sections, 1);
    }

    #[tokio::test]
    async fn test_read_from_async_source() {
        let input = sample_stream();
        let (first, rest) = input.split_at(1000);
        let (second, third) = rest.split_at(4321);
        let mock = tokio_test::io::Builder::new().read(first).read(second).read(third).build();

        let (mut demuxer, captures) = capturing_demuxer();
        let total = demuxer.read_from(mock).await.unwrap();

        assert_eq!(total, input.len() as u64);
        let captures = captures.lock();
        assert_eq!(captures[&AC3_PID].packets.len(), 60);
        assert_eq!(captures[&MP3_PID].ended, 1);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ThrottleEvent {
        Pause,
        Resume,
    }

    #[derive(Default)]
    struct RecordingThrottle {
        events: Mutex<Vec<ThrottleEvent>>,
    }

    impl QueueThrottle for RecordingThrottle {
        fn pause(&self) {
            self.events.lock().push(ThrottleEvent::Pause);
        }

        fn resume(&self) {
            self.events.lock().push(ThrottleEvent::Resume);
        }
    }

    #[test]
    fn test_demuxer_feeds_stream_buffers_with_backpressure() {
        let config = BufferingConfig {
            duration_starting_done: Duration::from_millis(320),
            bytes_minimum_starting: 0,
            duration_read_disable: Duration::from_secs(1),
            duration_read_enable: Duration::from_millis(500),
            ..BufferingConfig::default()
        };
        let throttle = Arc::new(RecordingThrottle::default());
        let manager = Arc::new(BufferingManager::new(config, throttle.clone()));
        let pool = PacketPool::default();

        let buffers: Arc<Mutex<Vec<Arc<StreamBuffer>>>> = Arc::default();
        let factory_buffers = buffers.clone();
        let factory_manager = manager.clone();
        let factory_pool = pool.clone();
        let mut demuxer = TsDemuxer::builder()
            .pool(pool.clone())
            .sink_factory(move |_stream| {
                let buffer = StreamBuffer::new(factory_manager.clone(), factory_pool.clone());
                factory_buffers.lock().push(buffer.clone());
                Some(Box::new(buffer) as Box<dyn PacketSink>)
            })
            .build()
            .unwrap();

        let mut stream = Stream::default();
        let frames: Vec<u8> = (0..50).flat_map(ac3_frame).collect();
        stream
            .section(PID_PAT, &pat_section(1, 0, 0, 0, &[(1, PMT_PID)]))
            .section(PMT_PID, &pmt_section(1, 0, AC3_PID, &[PmtStreamSpec::new(STREAM_TYPE_AC3, AC3_PID)]))
            .pes(AC3_PID, &pes(0xBD, Duration::ZERO, &frames, true));
        demuxer.process_data(&stream.take());

        let buffer = buffers.lock()[0].clone();
        assert_eq!(buffer.len(), 50);
        assert!(!manager.is_buffering());
        assert!(manager.is_blocked());
        assert_eq!(*throttle.events.lock(), vec![ThrottleEvent::Pause]);

        let mut expected_pts = Duration::ZERO;
        for _ in 0..50 {
            match buffer.next_packet() {
                NextPacket::Packet(packet) => {
                    assert_eq!(packet.pts, Some(expected_pts));
                    expected_pts += Duration::from_millis(32);
                    pool.free(packet);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(!manager.is_blocked());
        assert_eq!(*throttle.events.lock(), vec![ThrottleEvent::Pause, ThrottleEvent::Resume]);

        demuxer.process_end_of_data();
        assert!(matches!(buffer.next_packet(), NextPacket::EndOfStream));
        assert_eq!(pool.stats().outstanding, 0);
    }
}
