use std::time::Duration;

use bytes::{Bytes, BytesMut};
use media_packet::{
    AudioStreamConfig, DrmInitData, EncryptedPacket, MediaPacket, Packet, PsshBox, StreamConfig,
    StreamType, VideoStreamConfig,
};
use tracing::{debug, info, trace, warn};

use crate::{
    DemuxerConfig, DemuxerError, Result,
    codec::{extradata_to_annexb, length_prefixed_to_annexb, nal_length_size},
    engine::{AnyEngine, ContainerEngine, EngineFrame, EngineHandle, EngineStream, MediaType, VARIANT_BITRATE_TAG},
    source::DataSource,
};

/// Result of opening a clip.
#[derive(Debug, Clone)]
pub struct ClipInfo {
    pub duration: Option<Duration>,
    pub streams: Vec<EngineStream>,
}

/// Per-stream codec setup derived from the stream's extra data.
#[derive(Debug, Default)]
struct StreamSetup {
    /// Extra data the cached values were derived from
    source: Bytes,
    parsed: bool,
    parameter_sets: Option<Bytes>,
    nal_length_size: Option<usize>,
    /// Whether the parameter sets already went out in front of a keyframe
    prepended: bool,
}

impl StreamSetup {
    fn refresh(&mut self, stream: &EngineStream) {
        if self.parsed && self.source == stream.extra_data {
            return;
        }
        if self.parsed {
            debug!(index = stream.index, "Codec extra data changed, prepending new parameter sets");
        }
        self.source = stream.extra_data.clone();
        self.parameter_sets = extradata_to_annexb(stream.codec, &stream.extra_data);
        self.nal_length_size = nal_length_size(stream.codec, &stream.extra_data);
        self.prepended = false;
        self.parsed = true;
    }
}

/// Owns one container engine and turns its frames into [`MediaPacket`]s.
///
/// Timestamps are rescaled from each stream's time base to the millisecond
/// timeline; negative values clamp to zero.
pub struct Demuxer<E: ContainerEngine = AnyEngine> {
    engine: EngineHandle<E>,
    config: DemuxerConfig,
    opened: bool,
    setups: Vec<StreamSetup>,
}

impl Demuxer<AnyEngine> {
    /// Demuxer that detects the container format on open.
    pub fn with_config(config: DemuxerConfig) -> Self {
        Self::new(AnyEngine::new(), config)
    }
}

impl<E: ContainerEngine> Demuxer<E> {
    pub fn new(engine: E, config: DemuxerConfig) -> Self {
        Self {
            engine: EngineHandle::new(engine),
            config,
            opened: false,
            setups: Vec::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened { Ok(()) } else { Err(DemuxerError::NotOpen) }
    }

    /// Opens the source and probes its streams.
    pub fn open(&mut self, source: DataSource) -> Result<ClipInfo> {
        if self.opened {
            return Err(DemuxerError::AlreadyOpen);
        }
        debug!(engine = self.engine.name(), config = %self.config, "Opening demuxer input");
        self.engine.open_input(source, &self.config)?;
        self.engine.find_stream_info()?;
        self.opened = true;

        let info = ClipInfo {
            duration: self.duration(),
            streams: self.engine.streams().to_vec(),
        };
        info!(
            engine = self.engine.name(),
            streams = info.streams.len(),
            duration_ms = info.duration.map(|d| d.as_millis() as u64),
            "Demuxer opened"
        );
        Ok(info)
    }

    pub fn streams(&self) -> &[EngineStream] {
        self.engine.streams()
    }

    /// Discards every stream, then re-enables the listed ones. Out of range
    /// indexes are ignored.
    pub fn enable_streams(&mut self, indexes: &[usize]) -> Result<()> {
        self.ensure_open()?;
        let count = self.engine.streams().len();
        for index in 0..count {
            self.engine.set_discard(index, true)?;
        }
        for &index in indexes {
            if index < count {
                self.engine.set_discard(index, false)?;
            } else {
                warn!(index, count, "Ignoring invalid stream index");
            }
        }
        debug!(?indexes, "Enabled streams");
        Ok(())
    }

    fn streams_of(&self, stream_type: StreamType) -> impl Iterator<Item = &EngineStream> {
        self.engine
            .streams()
            .iter()
            .filter(move |s| s.stream_type() == Some(stream_type))
    }

    /// Best stream of a type: video by picture area then bitrate, audio by
    /// bitrate then channel count. Ties keep the earlier stream.
    pub fn find_best_stream(&self, stream_type: StreamType) -> Option<usize> {
        let rank = |s: &EngineStream| -> (u64, u64) {
            match stream_type {
                StreamType::Video => (s.width as u64 * s.height as u64, s.bitrate),
                StreamType::Audio => (s.bitrate, s.channels as u64),
                StreamType::Subtitle => (0, 0),
            }
        };
        let mut best: Option<(usize, (u64, u64))> = None;
        for stream in self.streams_of(stream_type) {
            let score = rank(stream);
            if best.is_none_or(|(_, current)| score > current) {
                best = Some((stream.index, score));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Stream of a type with the highest `variant_bitrate` tag.
    ///
    /// A candidate without the tag aborts the selection and yields `None`;
    /// a tag that does not parse is skipped.
    pub fn find_best_bandwidth_stream(&self, stream_type: StreamType) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for stream in self.streams_of(stream_type) {
            let Some(tag) = stream.metadata.get(VARIANT_BITRATE_TAG) else {
                debug!(index = stream.index, "Stream has no variant bitrate, no bandwidth selection");
                return None;
            };
            match tag.trim().parse::<u64>() {
                Ok(bitrate) => {
                    if best.is_none_or(|(_, current)| bitrate > current) {
                        best = Some((stream.index, bitrate));
                    }
                }
                Err(e) => warn!(index = stream.index, tag = %tag, error = %e, "Unparsable variant bitrate"),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Decoder configuration of an audio or video stream.
    pub fn read_config(&self, index: usize) -> Result<StreamConfig> {
        let stream = self
            .engine
            .streams()
            .get(index)
            .ok_or(DemuxerError::InvalidStreamIndex(index))?;
        match stream.media_type {
            MediaType::Video => {
                let (num, den) = stream
                    .frame_rate
                    .map_or((0, 1), |r| (r.num.max(0) as u32, r.den.max(1) as u32));
                Ok(StreamConfig::Video(VideoStreamConfig {
                    codec: stream.codec,
                    stream_index: index,
                    width: stream.width,
                    height: stream.height,
                    frame_rate_num: num,
                    frame_rate_den: den,
                    bitrate: stream.bitrate,
                    extra_data: stream.extra_data.clone(),
                }))
            }
            MediaType::Audio => Ok(StreamConfig::Audio(AudioStreamConfig {
                codec: stream.codec,
                stream_index: index,
                sample_rate: stream.sample_rate,
                channels: stream.channels,
                bits_per_channel: stream.bits_per_sample,
                bitrate: stream.bitrate,
                language: stream.language().map(str::to_string),
                extra_data: stream.extra_data.clone(),
            })),
            _ => Err(DemuxerError::UnsupportedStream(index)),
        }
    }

    /// Next packet of an enabled audio, video or subtitle stream; `None` at
    /// end of input.
    pub fn next_packet(&mut self) -> Result<Option<MediaPacket>> {
        self.ensure_open()?;
        loop {
            let Some(frame) = self.engine.read_frame()? else {
                debug!("Demuxer reached end of input");
                return Ok(None);
            };
            if let Some(packet) = self.build_packet(frame) {
                return Ok(Some(packet));
            }
        }
    }

    fn build_packet(&mut self, frame: EngineFrame) -> Option<MediaPacket> {
        let stream = self.engine.streams().get(frame.stream_index)?;
        if stream.discard {
            return None;
        }
        let stream_type = stream.stream_type()?;
        let time_base = stream.time_base;
        let to_ms = |ts: i64| Duration::from_millis(time_base.to_millis(ts).max(0) as u64);

        let dts = frame.dts.or(frame.pts).unwrap_or(0);
        let pts = frame.pts.unwrap_or(dts);
        let mut data = frame.data;
        let mut prefix = None;

        if stream.media_type == MediaType::Video {
            if self.setups.len() <= stream.index {
                self.setups.resize_with(stream.index + 1, StreamSetup::default);
            }
            let setup = &mut self.setups[stream.index];
            setup.refresh(stream);
            if setup.nal_length_size == Some(4)
                && let Some(converted) = length_prefixed_to_annexb(&data)
            {
                data = converted;
            }
            if frame.key_frame && !setup.prepended {
                if let Some(sets) = &setup.parameter_sets {
                    prefix = Some(sets.clone());
                }
                setup.prepended = true;
            }
        }

        let packet = Packet::new(stream_type, to_ms(pts), to_ms(dts), data)
            .with_duration(to_ms(frame.duration))
            .with_key_frame(frame.key_frame);
        let mut packet = match frame.encryption {
            Some(encryption) => MediaPacket::Encrypted(
                EncryptedPacket::new(packet, encryption.key_id, encryption.iv, encryption.subsamples)
                    .with_scheme(encryption.scheme, encryption.pattern),
            ),
            None => MediaPacket::Clear(packet),
        };
        if let Some(prefix) = prefix {
            trace!(index = frame.stream_index, len = prefix.len(), "Prepending parameter sets");
            packet.prepend(&prefix);
        }
        Some(packet)
    }

    /// Protection system data of all streams as concatenated `pssh` boxes.
    pub fn drm_init_data(&self) -> Option<DrmInitData> {
        let mut seen: Vec<Bytes> = Vec::new();
        let mut data = BytesMut::new();
        for stream in self.engine.streams() {
            for init in &stream.encryption_init {
                let pssh = PsshBox::new(init.system_id, init.key_ids.clone(), init.data.clone()).to_bytes();
                if !seen.contains(&pssh) {
                    data.extend_from_slice(&pssh);
                    seen.push(pssh);
                }
            }
        }
        if data.is_empty() {
            return None;
        }
        debug!(boxes = seen.len(), "Collected DRM init data");
        Some(DrmInitData::cenc(data.freeze()))
    }

    /// Stream that drives seeking: the enabled video stream, else the last
    /// enabled audio stream.
    fn seek_stream(&self) -> Option<&EngineStream> {
        let enabled = || self.engine.streams().iter().filter(|s| !s.discard);
        enabled()
            .find(|s| s.media_type == MediaType::Video)
            .or_else(|| enabled().filter(|s| s.media_type == MediaType::Audio).last())
    }

    /// Seeks to the keyframe at or before `time`, clamped to the playable
    /// range of the driving stream.
    pub fn seek(&mut self, time: Duration) -> Result<()> {
        self.ensure_open()?;
        let stream = self.seek_stream().ok_or(DemuxerError::InvalidStreamIndex(usize::MAX))?;
        let index = stream.index;
        let requested = stream.time_base.from_millis(time.as_millis() as i64);

        let mut target = requested;
        if let Some(first) = stream.first_dts {
            target = target.max(first);
        }
        if let Some(last) = stream.index_entries.last() {
            target = target.min(last.timestamp);
        }
        if let Some(duration) = stream.duration {
            target = target.min(stream.first_dts.unwrap_or(0) + duration);
        }

        debug!(index, requested, target, "Seeking");
        self.engine.seek_frame(index, target, true)?;
        for setup in &mut self.setups {
            setup.prepended = false;
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.engine.duration()
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Closes the engine. Also happens on drop.
    pub fn close(&mut self) {
        self.engine.close();
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use media_packet::{Codec, EncryptionScheme, KeyId, Subsample, SystemId};
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::{EncryptionInitInfo, FrameEncryption, Rational};
    use crate::{MemorySource, engine::iso};

    #[derive(Default)]
    struct Calls {
        seeks: Vec<(usize, i64, bool)>,
        closed: usize,
    }

    struct ScriptedEngine {
        streams: Vec<EngineStream>,
        frames: VecDeque<EngineFrame>,
        calls: Arc<Mutex<Calls>>,
    }

    impl ScriptedEngine {
        fn new(streams: Vec<EngineStream>, frames: Vec<EngineFrame>) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let engine = Self {
                streams,
                frames: frames.into(),
                calls: calls.clone(),
            };
            (engine, calls)
        }
    }

    impl ContainerEngine for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn open_input(&mut self, _source: DataSource, _config: &DemuxerConfig) -> Result<()> {
            Ok(())
        }

        fn find_stream_info(&mut self) -> Result<()> {
            Ok(())
        }

        fn streams(&self) -> &[EngineStream] {
            &self.streams
        }

        fn set_discard(&mut self, index: usize, discard: bool) -> Result<()> {
            self.streams
                .get_mut(index)
                .ok_or(DemuxerError::InvalidStreamIndex(index))?
                .discard = discard;
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Option<EngineFrame>> {
            Ok(self.frames.pop_front())
        }

        fn seek_frame(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()> {
            self.calls.lock().seeks.push((stream_index, timestamp, backward));
            Ok(())
        }

        fn duration(&self) -> Option<Duration> {
            None
        }

        fn close(&mut self) {
            self.calls.lock().closed += 1;
        }
    }

    fn stream(index: usize, media_type: MediaType, tags: &[(&str, &str)]) -> EngineStream {
        let codec = match media_type {
            MediaType::Video => Codec::H264,
            _ => Codec::Aac,
        };
        let mut stream = EngineStream::new(index, media_type, codec, Rational::new(1, 1000));
        stream.metadata = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        stream
    }

    fn frame(stream_index: usize, ts: i64, key_frame: bool, data: &'static [u8]) -> EngineFrame {
        EngineFrame {
            stream_index,
            pts: Some(ts),
            dts: Some(ts),
            duration: 40,
            key_frame,
            data: Bytes::from_static(data),
            encryption: None,
        }
    }

    fn open(streams: Vec<EngineStream>, frames: Vec<EngineFrame>) -> (Demuxer<ScriptedEngine>, Arc<Mutex<Calls>>) {
        let (engine, calls) = ScriptedEngine::new(streams, frames);
        let mut demuxer = Demuxer::new(engine, DemuxerConfig::default());
        demuxer
            .open(DataSource::pull(MemorySource::new(Vec::<u8>::new())))
            .unwrap();
        (demuxer, calls)
    }

    #[test]
    fn test_bandwidth_selection_aborts_on_untagged_stream() {
        let streams = vec![
            stream(0, MediaType::Video, &[("variant_bitrate", "500000")]),
            stream(1, MediaType::Video, &[]),
            stream(2, MediaType::Video, &[("variant_bitrate", "900000")]),
        ];
        let (demuxer, _) = open(streams, vec![]);
        assert_eq!(demuxer.find_best_bandwidth_stream(StreamType::Video), None);
    }

    #[test]
    fn test_bandwidth_selection_skips_unparsable_tag() {
        let streams = vec![
            stream(0, MediaType::Audio, &[("variant_bitrate", "128000")]),
            stream(1, MediaType::Audio, &[("variant_bitrate", "fast")]),
            stream(2, MediaType::Audio, &[("variant_bitrate", "256000")]),
            stream(3, MediaType::Audio, &[("variant_bitrate", "256000")]),
        ];
        let (demuxer, _) = open(streams, vec![]);
        assert_eq!(demuxer.find_best_bandwidth_stream(StreamType::Audio), Some(2));
        assert_eq!(demuxer.find_best_bandwidth_stream(StreamType::Subtitle), None);
    }

    #[test]
    fn test_find_best_stream() {
        let mut small = stream(0, MediaType::Video, &[]);
        (small.width, small.height, small.bitrate) = (640, 360, 9_000_000);
        let mut large = stream(1, MediaType::Video, &[]);
        (large.width, large.height, large.bitrate) = (1920, 1080, 4_000_000);
        let mut stereo = stream(2, MediaType::Audio, &[]);
        (stereo.bitrate, stereo.channels) = (128_000, 2);
        let mut surround = stream(3, MediaType::Audio, &[]);
        (surround.bitrate, surround.channels) = (128_000, 6);
        let (demuxer, _) = open(vec![small, large, stereo, surround], vec![]);
        assert_eq!(demuxer.find_best_stream(StreamType::Video), Some(1));
        assert_eq!(demuxer.find_best_stream(StreamType::Audio), Some(3));
        assert_eq!(demuxer.find_best_stream(StreamType::Subtitle), None);
    }

    #[test]
    fn test_seek_clamps_before_first_timestamp() {
        let mut video = stream(0, MediaType::Video, &[]);
        video.first_dts = Some(2000);
        video.duration = Some(60_000);
        video.add_index_entry(2000, 0);
        video.add_index_entry(10_000, 100);
        let (mut demuxer, calls) = open(vec![video, stream(1, MediaType::Audio, &[])], vec![]);
        demuxer.enable_streams(&[0, 1]).unwrap();

        demuxer.seek(Duration::from_millis(500)).unwrap();
        demuxer.seek(Duration::from_secs(30)).unwrap();
        assert_eq!(calls.lock().seeks, vec![(0, 2000, true), (0, 10_000, true)]);
    }

    #[test]
    fn test_seek_uses_last_enabled_audio() {
        let streams = vec![
            stream(0, MediaType::Video, &[]),
            stream(1, MediaType::Audio, &[]),
            stream(2, MediaType::Audio, &[]),
        ];
        let (mut demuxer, calls) = open(streams, vec![]);
        demuxer.enable_streams(&[1, 2]).unwrap();
        demuxer.seek(Duration::from_secs(1)).unwrap();
        assert_eq!(calls.lock().seeks, vec![(2, 1000, true)]);

        demuxer.enable_streams(&[]).unwrap();
        assert!(matches!(
            demuxer.seek(Duration::ZERO),
            Err(DemuxerError::InvalidStreamIndex(_))
        ));
    }

    #[test]
    fn test_packets_rescaled_and_filtered() {
        let mut video = stream(0, MediaType::Video, &[]);
        video.time_base = Rational::new(1, 90_000);
        let frames = vec![
            EngineFrame {
                pts: Some(-900),
                dts: Some(-1800),
                duration: 3600,
                ..frame(0, 0, true, b"\x00\x00\x00\x01\x65")
            },
            frame(1, 10, true, b"aac"),
            frame(0, 3600, false, b"\x00\x00\x00\x01\x41"),
        ];
        let (mut demuxer, _) = open(vec![video, stream(1, MediaType::Audio, &[])], frames);
        demuxer.enable_streams(&[0]).unwrap();

        let first = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(first.stream_type(), StreamType::Video);
        assert_eq!(first.pts(), Duration::ZERO);
        assert_eq!(first.dts(), Duration::ZERO);
        assert_eq!(first.packet().duration, Duration::from_millis(40));
        let second = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(second.pts(), Duration::from_millis(40));
        assert!(demuxer.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_parameter_sets_prepended_once_per_stream() {
        const AVCC: [u8; 18] = [
            0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00,
            0x03, 0x68, 0xEE, 0x3C,
        ];
        let mut video = stream(0, MediaType::Video, &[]);
        video.extra_data = Bytes::from_static(&AVCC);
        let frames = vec![
            frame(0, 0, true, &[0, 0, 0, 1, 0x65]),
            frame(0, 40, false, &[0, 0, 0, 1, 0x41]),
            frame(0, 80, true, &[0, 0, 0, 1, 0x65]),
        ];
        let (mut demuxer, _) = open(vec![video], frames);

        let first = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(
            &first.packet().data[..],
            &[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F, 0, 0, 0, 1, 0x68, 0xEE, 0x3C, 0, 0, 0, 1, 0x65][..]
        );
        // Length prefix of 1 rewritten as a start code
        let second = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(&second.packet().data[..], &[0, 0, 0, 1, 0x41]);
        let third = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(third.len(), 5);
    }

    #[test]
    fn test_encrypted_frame_keeps_subsample_invariant() {
        const AVCC: [u8; 18] = [
            0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00,
            0x03, 0x68, 0xEE, 0x3C,
        ];
        let mut video = stream(0, MediaType::Video, &[]);
        video.extra_data = Bytes::from_static(&AVCC);
        let mut encrypted = frame(0, 0, true, &[0, 0, 0, 4, 0x65, 1, 2, 3]);
        encrypted.encryption = Some(FrameEncryption {
            scheme: EncryptionScheme::Cenc,
            key_id: KeyId([7; 16]),
            iv: Bytes::from_static(&[1; 8]),
            subsamples: vec![Subsample::new(5, 3)],
            pattern: None,
        });
        let (mut demuxer, _) = open(vec![video], vec![encrypted]);

        let packet = demuxer.next_packet().unwrap().unwrap();
        let MediaPacket::Encrypted(packet) = packet else {
            panic!("expected an encrypted packet");
        };
        assert_eq!(packet.key_id, KeyId([7; 16]));
        assert_eq!(packet.packet.len(), 15 + 8);
        assert_eq!(packet.subsamples, vec![Subsample::new(20, 3)]);
        assert!(packet.validate_layout().is_ok());
    }

    #[test]
    fn test_drm_init_data_deduplicated() {
        let info = EncryptionInitInfo {
            system_id: SystemId::COMMON,
            key_ids: vec![KeyId([1; 16])],
            data: Bytes::new(),
        };
        let mut video = stream(0, MediaType::Video, &[]);
        video.encryption_init = vec![info.clone()];
        let mut audio = stream(1, MediaType::Audio, &[]);
        audio.encryption_init = vec![info.clone()];
        let (demuxer, _) = open(vec![video, audio], vec![]);

        let init = demuxer.drm_init_data().unwrap();
        let expected = PsshBox::new(info.system_id, info.key_ids, info.data).to_bytes();
        assert_eq!(init.data, expected);
        assert_eq!(init.data.len(), 32 + 4 + 16);

        let (clear, _) = open(vec![stream(0, MediaType::Video, &[])], vec![]);
        assert!(clear.drm_init_data().is_none());
    }

    #[test]
    fn test_read_config() {
        let mut audio = stream(0, MediaType::Audio, &[("language", "eng")]);
        (audio.sample_rate, audio.channels) = (48_000, 2);
        let (demuxer, _) = open(vec![audio, stream(1, MediaType::Data, &[])], vec![]);
        let StreamConfig::Audio(config) = demuxer.read_config(0).unwrap() else {
            panic!("expected audio config");
        };
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.language.as_deref(), Some("eng"));
        assert!(matches!(demuxer.read_config(1), Err(DemuxerError::UnsupportedStream(1))));
        assert!(matches!(demuxer.read_config(5), Err(DemuxerError::InvalidStreamIndex(5))));
    }

    #[test]
    fn test_engine_closed_once_on_drop() {
        let (mut demuxer, calls) = open(vec![], vec![]);
        demuxer.close();
        drop(demuxer);
        assert_eq!(calls.lock().closed, 1);
    }

    #[test]
    fn test_fragmented_mp4_end_to_end() {
        let data = [iso::tests::init_segment(true), iso::tests::media_segment(1, 0, 2, true)].concat();
        let mut demuxer = Demuxer::with_config(DemuxerConfig::builder().variant_bitrate(800_000).build());
        let info = demuxer.open(DataSource::pull(MemorySource::new(data))).unwrap();
        assert_eq!(info.streams.len(), 1);
        assert_eq!(demuxer.find_best_bandwidth_stream(StreamType::Video), Some(0));

        let init = demuxer.drm_init_data().unwrap();
        let boxes = PsshBox::parse_all(&init.data).unwrap();
        assert_eq!(boxes[0].key_ids, vec![KeyId(iso::tests::KID)]);

        let MediaPacket::Encrypted(first) = demuxer.next_packet().unwrap().unwrap() else {
            panic!("expected an encrypted packet");
        };
        assert!(first.packet.is_key_frame);
        assert_eq!(&first.packet.data[15..19], &[0, 0, 0, 1]);
        assert!(first.validate_layout().is_ok());
        assert!(demuxer.next_packet().unwrap().is_some());
        assert!(demuxer.next_packet().unwrap().is_none());
    }
}
