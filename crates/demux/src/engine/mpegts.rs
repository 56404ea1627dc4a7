use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use media_packet::{Codec, StreamType};
use tracing::{debug, trace, warn};
use ts::{EsFrame, Pmt, TsDemuxer, TsEvent};

use super::{ContainerEngine, EngineFrame, EngineStream, MediaType, Rational, reader::SourceReader};
use crate::{
    DemuxerConfig, DemuxerError, Result,
    codec::{annexb_has_keyframe, parse_adts},
    source::DataSource,
};

const TIME_BASE: Rational = Rational::new(1, 90_000);
const WRAP: i64 = 1 << 33;
const HALF_WRAP: i64 = 1 << 32;

/// MPEG transport stream engine.
#[derive(Default)]
pub struct TsEngine {
    reader: Option<SourceReader>,
    config: DemuxerConfig,
    demuxer: TsDemuxer,
    streams: Vec<EngineStream>,
    pids: Vec<u16>,
    pending: VecDeque<EngineFrame>,
    last_dts: HashMap<usize, i64>,
    eof: bool,
}

impl TsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn reader(&mut self) -> Result<&mut SourceReader> {
        self.reader.as_mut().ok_or(DemuxerError::NotOpen)
    }

    fn on_program(&mut self, pmt: &Pmt) {
        for es in &pmt.streams {
            if self.pids.contains(&es.elementary_pid) {
                continue;
            }
            let codec = es.codec();
            let media_type = match codec.stream_type() {
                Some(StreamType::Video) => MediaType::Video,
                Some(StreamType::Audio) => MediaType::Audio,
                _ => MediaType::Data,
            };
            let index = self.streams.len();
            let mut stream = EngineStream::new(index, media_type, codec, TIME_BASE);
            if let Some(language) = &es.language {
                stream.metadata.insert("language".to_string(), language.clone());
            }
            stream.apply_config(&self.config);
            debug!(index, pid = es.elementary_pid, ?codec, "Found transport stream");
            self.streams.push(stream);
            self.pids.push(es.elementary_pid);
        }
    }

    /// Maps a 33-bit timestamp onto a continuous timeline near the previous one.
    fn unwrap_timestamp(&self, index: usize, ts: u64) -> i64 {
        let ts = ts as i64;
        let Some(&last) = self.last_dts.get(&index) else {
            return ts;
        };
        let mut candidate = last.div_euclid(WRAP) * WRAP + ts;
        if candidate - last > HALF_WRAP {
            candidate -= WRAP;
        } else if last - candidate > HALF_WRAP {
            candidate += WRAP;
        }
        candidate
    }

    fn on_frame(&mut self, es: EsFrame) -> Option<EngineFrame> {
        let index = self.pids.iter().position(|&pid| pid == es.pid)?;
        let pts = es.pts.map(|ts| self.unwrap_timestamp(index, ts));
        let dts = es.dts.map(|ts| self.unwrap_timestamp(index, ts)).or(pts);
        if let Some(dts) = dts {
            self.last_dts.insert(index, dts);
        }

        let stream = &mut self.streams[index];
        let key_frame = match stream.media_type {
            MediaType::Video => es.random_access || annexb_has_keyframe(stream.codec, &es.data),
            _ => true,
        };
        if stream.first_dts.is_none() {
            stream.first_dts = dts;
            if stream.codec == Codec::Aac
                && let Some(adts) = parse_adts(&es.data)
            {
                stream.sample_rate = adts.sample_rate;
                stream.channels = adts.channels;
                stream.extra_data = adts.audio_specific_config;
            }
        }
        if key_frame
            && stream.media_type == MediaType::Video
            && let Some(dts) = dts
        {
            stream.add_index_entry(dts, es.offset);
        }

        Some(EngineFrame {
            stream_index: index,
            pts,
            dts,
            duration: 0,
            key_frame,
            data: es.data,
            encryption: None,
        })
    }

    /// Moves demuxer events into the frame queue. Returns whether anything
    /// was queued.
    fn drain_events(&mut self) -> bool {
        let mut queued = false;
        while let Some(event) = self.demuxer.next_event() {
            match event {
                TsEvent::Program(pmt) => self.on_program(&pmt),
                TsEvent::Frame(es) => {
                    if let Some(frame) = self.on_frame(es) {
                        self.pending.push_back(frame);
                        queued = true;
                    }
                }
            }
        }
        queued
    }

    /// Reads one chunk into the demuxer. Returns `false` at end of input.
    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = vec![0u8; self.config.read_chunk_size];
        let n = self.reader()?.read(&mut chunk)?;
        if n == 0 {
            trace!("Transport stream input ended");
            self.demuxer.flush();
            self.eof = true;
        } else {
            self.demuxer.feed(&chunk[..n]);
        }
        self.drain_events();
        Ok(n > 0)
    }

    fn probe_complete(&self) -> bool {
        !self.streams.is_empty()
            && self
                .streams
                .iter()
                .filter(|s| s.media_type != MediaType::Data)
                .all(|s| s.first_dts.is_some())
    }

    fn analyzed_span(&self) -> Duration {
        let (Some(first), Some(last)) = (
            self.pending.front().and_then(|f| f.dts),
            self.pending.back().and_then(|f| f.dts),
        ) else {
            return Duration::ZERO;
        };
        Duration::from_millis(TIME_BASE.to_millis(last - first).max(0) as u64)
    }

    fn reposition(&mut self, position: u64) -> Result<()> {
        self.reader()?.seek(position)?;
        self.demuxer.reset(position);
        self.pending.clear();
        self.last_dts.clear();
        self.eof = false;
        Ok(())
    }
}

impl ContainerEngine for TsEngine {
    fn name(&self) -> &'static str {
        "mpegts"
    }

    fn open_input(&mut self, source: DataSource, config: &DemuxerConfig) -> Result<()> {
        if self.reader.is_some() {
            return Err(DemuxerError::AlreadyOpen);
        }
        self.reader = Some(SourceReader::new(source.into_pull()?));
        self.config = config.clone();
        Ok(())
    }

    fn find_stream_info(&mut self) -> Result<()> {
        let start = self.reader()?.position();
        loop {
            if self.probe_complete() {
                break;
            }
            let consumed = self.reader()?.position() - start;
            if consumed >= self.config.probe_size as u64
                || self.analyzed_span() >= self.config.max_analyze_duration
            {
                debug!(consumed, "Probe limit reached before every stream was seen");
                break;
            }
            if !self.fill()? {
                break;
            }
        }

        if self.streams.is_empty() {
            return Err(DemuxerError::StreamInfo(
                "no program map found in transport stream".to_string(),
            ));
        }
        debug!(
            streams = self.streams.len(),
            queued = self.pending.len(),
            "Transport stream probed"
        );
        Ok(())
    }

    fn streams(&self) -> &[EngineStream] {
        &self.streams
    }

    fn set_discard(&mut self, index: usize, discard: bool) -> Result<()> {
        let stream = self
            .streams
            .get_mut(index)
            .ok_or(DemuxerError::InvalidStreamIndex(index))?;
        stream.discard = discard;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<EngineFrame>> {
        loop {
            while let Some(frame) = self.pending.pop_front() {
                if !self.streams[frame.stream_index].discard {
                    return Ok(Some(frame));
                }
            }
            if !self.fill()? && self.pending.is_empty() {
                return Ok(None);
            }
        }
    }

    fn seek_frame(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()> {
        if stream_index >= self.streams.len() {
            return Err(DemuxerError::InvalidStreamIndex(stream_index));
        }
        if !self.reader()?.is_seekable() {
            return Err(DemuxerError::Seek("transport stream input is not seekable".to_string()));
        }

        // Extend the keyframe index by reading forward until the target is covered.
        let covered = |engine: &Self| {
            engine.streams[stream_index]
                .index_entries
                .last()
                .is_some_and(|e| e.timestamp >= timestamp)
        };
        while !covered(self) && (self.fill()? || !self.pending.is_empty()) {
            self.pending.clear();
        }

        let entries = &self.streams[stream_index].index_entries;
        let entry = if backward {
            entries.iter().rev().find(|e| e.timestamp <= timestamp)
        } else {
            entries.iter().find(|e| e.timestamp >= timestamp)
        }
        .or_else(|| entries.first())
        .copied();

        let position = entry.map_or(0, |e| e.position);
        debug!(stream_index, timestamp, position, "Seeking transport stream");
        self.reposition(position)
    }

    fn duration(&self) -> Option<Duration> {
        None
    }

    fn close(&mut self) {
        self.reader = None;
        self.pending.clear();
        let stats = self.demuxer.stats();
        if stats.invalid_packets > 0 || stats.dropped_units > 0 {
            warn!(
                invalid_packets = stats.invalid_packets,
                dropped_units = stats.dropped_units,
                resyncs = stats.resyncs,
                "Transport stream had damaged data"
            );
        }
    }
}
