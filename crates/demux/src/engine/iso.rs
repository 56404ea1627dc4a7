use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use media_packet::PsshBox;
use mp4::{BoxHeader, Fragment, FragmentSample, HandlerType, InitSegment, Track};
use tracing::{debug, trace, warn};

use super::{
    ContainerEngine, EncryptionInitInfo, EngineFrame, EngineStream, FrameEncryption, MediaType,
    Rational, reader::SourceReader,
};
use crate::{DemuxerConfig, DemuxerError, Result, source::DataSource};

/// Largest `moov`/`moof` payload loaded into memory.
const MAX_HEADER_BOX: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Samples addressed by the movie's sample tables
    Progressive,
    /// Samples delivered by `moof`/`mdat` pairs
    Fragmented,
}

/// ISO base media file format engine (progressive and fragmented).
#[derive(Default)]
pub struct Mp4Engine {
    reader: Option<SourceReader>,
    config: DemuxerConfig,
    init: Option<InitSegment>,
    layout: Option<Layout>,
    streams: Vec<EngineStream>,
    track_ids: Vec<u32>,
    pending: VecDeque<EngineFrame>,
    eof: bool,
    /// Next sample per stream (progressive)
    cursors: Vec<usize>,
    /// Fragment waiting for its `mdat`
    fragment: Option<(u64, Fragment)>,
    /// Running decode time per track (fragmented)
    next_decode_time: HashMap<u32, u64>,
    unprotected_warned: bool,
}

impl Mp4Engine {
    pub fn new() -> Self {
        Self::default()
    }

    fn reader(&mut self) -> Result<&mut SourceReader> {
        self.reader.as_mut().ok_or(DemuxerError::NotOpen)
    }

    fn init(&self) -> Result<&InitSegment> {
        self.init.as_ref().ok_or(DemuxerError::NotOpen)
    }

    /// Reads the next top-level box header, `None` at end of input.
    fn next_box(&mut self) -> Result<Option<(u64, BoxHeader)>> {
        let reader = self.reader()?;
        let start = reader.position();
        let mut header = [0u8; 32];
        if !reader.read_full(&mut header[..8])? {
            return Ok(None);
        }
        let mut len = 8;
        if header[..4] == [0, 0, 0, 1] {
            reader.read_full(&mut header[8..16])?;
            len = 16;
        }
        if &header[4..8] == b"uuid" {
            reader.read_full(&mut header[len..len + 16])?;
            len += 16;
        }
        let available = reader.size().map_or(u64::MAX, |size| size.saturating_sub(start));
        let parsed = BoxHeader::parse(&header[..len], available)?;
        Ok(Some((start, parsed)))
    }

    fn read_payload(&mut self, start: u64, header: &BoxHeader) -> Result<Bytes> {
        let reader = self.reader()?;
        if header.size == u64::MAX {
            return Ok(reader.read_to_end()?);
        }
        let payload_len = header.payload_len();
        if payload_len > MAX_HEADER_BOX && header.box_type != b"mdat" {
            return Err(DemuxerError::UnsupportedFormat(format!(
                "'{}' box at {start} is {payload_len} bytes",
                header.box_type
            )));
        }
        Ok(reader.read_bytes(payload_len as usize)?)
    }

    fn skip_box(&mut self, start: u64, header: &BoxHeader) -> Result<()> {
        if header.size == u64::MAX {
            self.eof = true;
            return Ok(());
        }
        let end = start + header.size;
        self.reader()?.seek(end)?;
        Ok(())
    }

    fn apply_init(&mut self, init: InitSegment) {
        let encryption_init: Vec<EncryptionInitInfo> = init.pssh.iter().map(to_init_info).collect();
        for track in &init.tracks {
            let position = self.track_ids.iter().position(|&id| id == track.track_id);
            match position {
                Some(index) => {
                    // A new init segment (representation switch) refreshes the codec setup.
                    let stream = &mut self.streams[index];
                    let fresh = build_stream(index, track, &init);
                    stream.codec = fresh.codec;
                    stream.extra_data = fresh.extra_data;
                    stream.width = fresh.width;
                    stream.height = fresh.height;
                    stream.sample_rate = fresh.sample_rate;
                    stream.channels = fresh.channels;
                    stream.bitrate = fresh.bitrate;
                    stream.time_base = fresh.time_base;
                }
                None => {
                    let index = self.streams.len();
                    let mut stream = build_stream(index, track, &init);
                    stream.encryption_init = encryption_init.clone();
                    stream.apply_config(&self.config);
                    debug!(index, track_id = track.track_id, codec = ?stream.codec, "Found MP4 track");
                    self.streams.push(stream);
                    self.track_ids.push(track.track_id);
                    self.cursors.push(0);
                }
            }
        }
        for info in &encryption_init {
            self.add_encryption_init(info);
        }
        self.init = Some(init);
    }

    fn add_encryption_init(&mut self, info: &EncryptionInitInfo) {
        for stream in &mut self.streams {
            if !stream.encryption_init.contains(info) {
                stream.encryption_init.push(info.clone());
            }
        }
    }

    fn frame_encryption(&mut self, index: usize, sample: &FragmentSample) -> Option<FrameEncryption> {
        let track = self.init.as_ref()?.track(self.track_ids[index])?;
        let protection = track.protection()?;
        let (iv, subsamples) = match &sample.encryption {
            Some(encryption) => (encryption.iv.clone(), encryption.subsamples.clone()),
            None if protection.default_is_protected => match &protection.default_constant_iv {
                Some(iv) => (iv.clone(), Vec::new()),
                None => {
                    if !self.unprotected_warned {
                        warn!(track_id = track.track_id, "Protected track has no sample encryption data");
                        self.unprotected_warned = true;
                    }
                    return None;
                }
            },
            None => return None,
        };
        Some(FrameEncryption {
            scheme: protection.scheme,
            key_id: protection.default_kid,
            iv,
            subsamples,
            pattern: protection.pattern,
        })
    }

    fn on_moof(&mut self, start: u64, payload: &[u8]) -> Result<()> {
        let init = self.init()?;
        let decode_times = &self.next_decode_time;
        let fragment = Fragment::parse(payload, start, init, |track_id| {
            decode_times.get(&track_id).copied().unwrap_or(0)
        })?;
        for pssh in &fragment.pssh {
            self.add_encryption_init(&to_init_info(pssh));
        }
        trace!(sequence = fragment.sequence_number, tracks = fragment.tracks.len(), "Parsed fragment");
        self.fragment = Some((start, fragment));
        Ok(())
    }

    fn on_mdat(&mut self, data_start: u64, data: Bytes) {
        let Some((moof_offset, fragment)) = self.fragment.take() else {
            trace!(data_start, "Media data without fragment header skipped");
            return;
        };
        let data_end = data_start + data.len() as u64;
        let mut frames = Vec::new();

        for traf in &fragment.tracks {
            let Some(index) = self.track_ids.iter().position(|&id| id == traf.track_id) else {
                continue;
            };
            if let Some(last) = traf.samples.last() {
                self.next_decode_time
                    .insert(traf.track_id, last.dts + last.duration as u64);
            }
            let edit = self.edit_offset(index);
            for sample in &traf.samples {
                let end = sample.offset + sample.size as u64;
                if sample.offset < data_start || end > data_end {
                    warn!(track_id = traf.track_id, offset = sample.offset, "Sample outside of media data");
                    continue;
                }
                let encryption = self.frame_encryption(index, sample);
                let stream = &mut self.streams[index];
                let dts = sample.dts as i64 - edit;
                if stream.first_dts.is_none() {
                    stream.first_dts = Some(dts);
                }
                if sample.is_sync && stream.media_type == MediaType::Video {
                    stream.add_index_entry(dts, moof_offset);
                }
                let rel = (sample.offset - data_start) as usize;
                frames.push((
                    sample.offset,
                    EngineFrame {
                        stream_index: index,
                        pts: Some(sample.pts() - edit),
                        dts: Some(dts),
                        duration: sample.duration as i64,
                        key_frame: sample.is_sync,
                        data: data.slice(rel..rel + sample.size as usize),
                        encryption,
                    },
                ));
            }
        }
        frames.sort_by_key(|(offset, _)| *offset);
        self.pending.extend(frames.into_iter().map(|(_, frame)| frame));
    }

    fn edit_offset(&self, index: usize) -> i64 {
        self.init
            .as_ref()
            .and_then(|init| init.track(self.track_ids[index]))
            .and_then(|t| t.edit_media_time)
            .unwrap_or(0)
    }

    /// Pulls top-level boxes until frames are queued or input ends.
    fn fill_fragmented(&mut self) -> Result<()> {
        while self.pending.is_empty() && !self.eof {
            let Some((start, header)) = self.next_box()? else {
                self.eof = true;
                break;
            };
            match &header.box_type.0 {
                b"moof" => {
                    let payload = self.read_payload(start, &header)?;
                    self.on_moof(start, &payload)?;
                }
                b"mdat" => {
                    let data_start = start + header.header_len as u64;
                    let data = self.read_payload(start, &header)?;
                    self.on_mdat(data_start, data);
                }
                b"moov" => {
                    let payload = self.read_payload(start, &header)?;
                    let init = InitSegment::parse_moov(&payload)?;
                    debug!(tracks = init.tracks.len(), "New movie header in stream");
                    self.apply_init(init);
                }
                _ => self.skip_box(start, &header)?,
            }
        }
        Ok(())
    }

    /// Next sample in file order among enabled streams (progressive).
    fn next_progressive(&mut self) -> Result<Option<EngineFrame>> {
        let init = self.init()?;
        let mut best: Option<(usize, u64)> = None;
        for (index, stream) in self.streams.iter().enumerate() {
            if stream.discard {
                continue;
            }
            let Some(track) = init.track(self.track_ids[index]) else {
                continue;
            };
            if let Some(sample) = track.samples.samples.get(self.cursors[index])
                && best.is_none_or(|(_, offset)| sample.offset < offset)
            {
                best = Some((index, sample.offset));
            }
        }
        let Some((index, _)) = best else {
            return Ok(None);
        };

        let track_id = self.track_ids[index];
        let Some(sample) = init
            .track(track_id)
            .and_then(|t| t.samples.samples.get(self.cursors[index]))
            .copied()
        else {
            return Ok(None);
        };
        let protected = init.track(track_id).and_then(Track::protection).is_some();
        let edit = self.edit_offset(index);
        self.cursors[index] += 1;

        if protected && !self.unprotected_warned {
            warn!(track_id, "Progressive protected tracks are passed through undecrypted");
            self.unprotected_warned = true;
        }

        let reader = self.reader()?;
        reader.seek(sample.offset)?;
        let data = reader.read_bytes(sample.size as usize)?;
        Ok(Some(EngineFrame {
            stream_index: index,
            pts: Some(sample.pts() - edit),
            dts: Some(sample.dts as i64 - edit),
            duration: sample.duration as i64,
            key_frame: sample.is_sync,
            data,
            encryption: None,
        }))
    }

    fn seek_progressive(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()> {
        let target_base = self.streams[stream_index].time_base;
        let target_ms = target_base.to_millis(timestamp);
        let init = self.init.as_ref().ok_or(DemuxerError::NotOpen)?;

        for index in 0..self.streams.len() {
            let Some(track) = init.track(self.track_ids[index]) else {
                continue;
            };
            let edit = track.edit_media_time.unwrap_or(0);
            let ts = self.streams[index].time_base.from_millis(target_ms) + edit;
            let samples = &track.samples.samples;
            let after = samples.partition_point(|s| (s.dts as i64) <= ts.max(0));
            let cursor = if index == stream_index {
                if backward {
                    track.samples.sync_sample_before(ts.max(0) as u64).unwrap_or(0)
                } else {
                    samples[after.saturating_sub(1)..]
                        .iter()
                        .position(|s| s.is_sync && s.dts as i64 >= ts)
                        .map_or(samples.len(), |p| p + after.saturating_sub(1))
                }
            } else {
                after.saturating_sub(1)
            };
            self.cursors[index] = cursor;
        }
        debug!(stream_index, timestamp, "Seeked progressive MP4");
        Ok(())
    }

    fn seek_fragmented(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()> {
        if !self.reader()?.is_seekable() {
            return Err(DemuxerError::Seek("fragmented input is not seekable".to_string()));
        }
        let covered = |engine: &Self| {
            engine.streams[stream_index]
                .index_entries
                .last()
                .is_some_and(|e| e.timestamp >= timestamp)
        };
        while !covered(self) && !self.eof {
            self.pending.clear();
            self.fill_fragmented()?;
        }

        let entries = &self.streams[stream_index].index_entries;
        let entry = if backward {
            entries.iter().rev().find(|e| e.timestamp <= timestamp)
        } else {
            entries.iter().find(|e| e.timestamp >= timestamp)
        }
        .or_else(|| entries.first())
        .copied()
        .ok_or_else(|| DemuxerError::Seek("no keyframe found".to_string()))?;

        self.reader()?.seek(entry.position)?;
        self.pending.clear();
        self.fragment = None;
        self.eof = false;
        debug!(stream_index, timestamp, position = entry.position, "Seeked fragmented MP4");
        Ok(())
    }
}

fn to_init_info(pssh: &PsshBox) -> EncryptionInitInfo {
    EncryptionInitInfo {
        system_id: pssh.system_id,
        key_ids: pssh.key_ids.clone(),
        data: pssh.data.clone(),
    }
}

fn build_stream(index: usize, track: &Track, init: &InitSegment) -> EngineStream {
    let media_type = match track.handler {
        HandlerType::Video => MediaType::Video,
        HandlerType::Audio => MediaType::Audio,
        HandlerType::Subtitle => MediaType::Subtitle,
        HandlerType::Other(_) => MediaType::Data,
    };
    let desc = &track.description;
    let time_base = Rational::new(1, track.timescale.max(1) as i64);
    let mut stream = EngineStream::new(index, media_type, desc.codec, time_base);
    stream.extra_data = desc.extra_data.clone();
    stream.bitrate = desc.avg_bitrate as u64;
    stream.width = desc.width as u32;
    stream.height = desc.height as u32;
    stream.sample_rate = desc.sample_rate;
    stream.channels = desc.channels;
    stream.bits_per_sample = desc.sample_size;
    if let Some(language) = &track.language {
        stream.metadata.insert("language".to_string(), language.clone());
    }

    let edit = track.edit_media_time.unwrap_or(0);
    if track.duration > 0 {
        stream.duration = Some(track.duration as i64);
    } else if let Some(movie) = init.fragment_duration.filter(|d| *d > 0) {
        stream.duration = Some(
            time_base.from_millis(Rational::new(1, init.timescale.max(1) as i64).to_millis(movie as i64)),
        );
    }

    let samples = &track.samples.samples;
    if let Some(first) = samples.first() {
        stream.first_dts = Some(first.dts as i64 - edit);
        if let Some(last) = samples.last() {
            let count = samples.len() as i64;
            let span = last.dts as i64 - first.dts as i64;
            if media_type == MediaType::Video && span > 0 && count > 1 {
                stream.frame_rate = Some(Rational::new((count - 1) * track.timescale as i64, span));
            }
        }
        for sample in samples.iter().filter(|s| s.is_sync) {
            if media_type == MediaType::Video {
                stream.add_index_entry(sample.dts as i64 - edit, sample.offset);
            }
        }
    }
    stream
}

impl ContainerEngine for Mp4Engine {
    fn name(&self) -> &'static str {
        "mp4"
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
        loop {
            let Some((start, header)) = self.next_box()? else {
                return Err(DemuxerError::StreamInfo("no movie header found".to_string()));
            };
            match &header.box_type.0 {
                b"moov" => {
                    let payload = self.read_payload(start, &header)?;
                    let init = InitSegment::parse_moov(&payload)?;
                    let layout = if init.fragmented {
                        Layout::Fragmented
                    } else {
                        Layout::Progressive
                    };
                    debug!(tracks = init.tracks.len(), ?layout, "Parsed movie header");
                    self.layout = Some(layout);
                    self.apply_init(init);
                    break;
                }
                b"moof" => {
                    return Err(DemuxerError::StreamInfo(
                        "movie fragment before movie header".to_string(),
                    ));
                }
                b"mdat" if header.size == u64::MAX => {
                    return Err(DemuxerError::StreamInfo(
                        "media data runs to the end of input before the movie header".to_string(),
                    ));
                }
                _ => self.skip_box(start, &header)?,
            }
        }

        if self.streams.is_empty() {
            return Err(DemuxerError::StreamInfo("movie has no tracks".to_string()));
        }
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
        match self.layout {
            None => Err(DemuxerError::NotOpen),
            Some(Layout::Progressive) => self.next_progressive(),
            Some(Layout::Fragmented) => loop {
                while let Some(frame) = self.pending.pop_front() {
                    if !self.streams[frame.stream_index].discard {
                        return Ok(Some(frame));
                    }
                }
                if self.eof {
                    return Ok(None);
                }
                self.fill_fragmented()?;
            },
        }
    }

    fn seek_frame(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()> {
        if stream_index >= self.streams.len() {
            return Err(DemuxerError::InvalidStreamIndex(stream_index));
        }
        match self.layout {
            None => Err(DemuxerError::NotOpen),
            Some(Layout::Progressive) => self.seek_progressive(stream_index, timestamp, backward),
            Some(Layout::Fragmented) => self.seek_fragmented(stream_index, timestamp, backward),
        }
    }

    fn duration(&self) -> Option<Duration> {
        let init = self.init.as_ref()?;
        let movie = if init.duration > 0 {
            init.duration
        } else {
            init.fragment_duration?
        };
        let millis = Rational::new(1, init.timescale.max(1) as i64).to_millis(movie as i64);
        Some(Duration::from_millis(millis.max(0) as u64))
    }

    fn close(&mut self) {
        self.reader = None;
        self.pending.clear();
        self.fragment = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use media_packet::{Codec, KeyId, SystemId};

    use super::*;
    use crate::MemorySource;

    pub(crate) fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn full_box(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![version, (flags >> 16) as u8, (flags >> 8) as u8, flags as u8];
        body.extend_from_slice(payload);
        mp4_box(box_type, &body)
    }

    fn be32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    pub(crate) const KID: [u8; 16] = [0x11; 16];

    const AVCC: [u8; 18] = [
        0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00, 0x03,
        0x68, 0xEE, 0x3C,
    ];

    /// Init segment with one AVC video track (id 1, 90 kHz). With `protected`
    /// the track carries `cenc` protection and a W3C common `pssh`.
    pub(crate) fn init_segment(protected: bool) -> Vec<u8> {
        let avcc = mp4_box(b"avcC", &AVCC);
        let (format, children) = if protected {
            let mut tenc = vec![0, 0, 1, 8];
            tenc.extend_from_slice(&KID);
            let sinf = mp4_box(
                b"sinf",
                &[
                    mp4_box(b"frma", b"avc1"),
                    full_box(b"schm", 0, 0, &[b'c', b'e', b'n', b'c', 0, 1, 0, 0]),
                    mp4_box(b"schi", &full_box(b"tenc", 0, 0, &tenc)),
                ]
                .concat(),
            );
            (b"encv", [avcc, sinf].concat())
        } else {
            (b"avc1", avcc)
        };
        let mut entry = vec![0u8; 78];
        entry[24..26].copy_from_slice(&640u16.to_be_bytes());
        entry[26..28].copy_from_slice(&360u16.to_be_bytes());
        entry.extend_from_slice(&children);
        let stsd = full_box(b"stsd", 0, 0, &[be32(&[1]), mp4_box(format, &entry)].concat());
        let stbl = mp4_box(
            b"stbl",
            &[
                stsd,
                full_box(b"stts", 0, 0, &be32(&[0])),
                full_box(b"stsc", 0, 0, &be32(&[0])),
                full_box(b"stsz", 0, 0, &be32(&[0, 0])),
                full_box(b"stco", 0, 0, &be32(&[0])),
            ]
            .concat(),
        );
        let mdia = mp4_box(
            b"mdia",
            &[
                full_box(b"mdhd", 0, 0, &[be32(&[0, 0, 90_000, 0]), vec![0x55, 0xC4, 0, 0]].concat()),
                full_box(b"hdlr", 0, 0, &[be32(&[0]), b"vide".to_vec(), vec![0; 13]].concat()),
                mp4_box(b"minf", &stbl),
            ]
            .concat(),
        );
        let trak = mp4_box(
            b"trak",
            &[full_box(b"tkhd", 0, 7, &[be32(&[0, 0, 1]), vec![0; 68]].concat()), mdia].concat(),
        );
        let mvex = mp4_box(b"mvex", &full_box(b"trex", 0, 0, &be32(&[1, 1, 3600, 0, 0x0001_0000])));
        let mut moov_children = vec![
            full_box(b"mvhd", 0, 0, &[be32(&[0, 0, 1000, 4000]), vec![0; 80]].concat()),
            trak,
            mvex,
        ];
        if protected {
            moov_children.push(full_box(
                b"pssh",
                1,
                0,
                &[SystemId::COMMON.0.to_vec(), be32(&[1]), KID.to_vec(), be32(&[0])].concat(),
            ));
        }
        [mp4_box(b"ftyp", b"iso6\0\0\0\0"), mp4_box(b"moov", &moov_children.concat())].concat()
    }

    /// One fragment of `count` video samples starting at `decode_time`; the
    /// first sample is a keyframe. Samples are length-prefixed NAL units.
    pub(crate) fn media_segment(sequence: u32, decode_time: u64, count: u32, protected: bool) -> Vec<u8> {
        let sample = |i: u32| -> Vec<u8> {
            let nal_type = if i == 0 { 0x65 } else { 0x41 };
            vec![0, 0, 0, 4, nal_type, i as u8, 0xAB, 0xCD]
        };
        let mut mdat_payload = Vec::new();
        let mut sizes = Vec::new();
        for i in 0..count {
            let s = sample(i);
            sizes.push(s.len() as u32);
            mdat_payload.extend_from_slice(&s);
        }

        let build = |data_offset: u32| -> Vec<u8> {
            let mut trun_body = be32(&[count, data_offset, 0x0200_0000]);
            for size in &sizes {
                trun_body.extend_from_slice(&size.to_be_bytes());
            }
            let mut traf_children = vec![
                full_box(b"tfhd", 0, 0x02_0000, &be32(&[1])),
                full_box(b"tfdt", 1, 0, &decode_time.to_be_bytes()),
                full_box(b"trun", 0, 0x01 | 0x04 | 0x200, &trun_body),
            ];
            if protected {
                let mut senc = be32(&[count]);
                for i in 0..count {
                    senc.extend_from_slice(&[i as u8; 8]);
                    senc.extend_from_slice(&1u16.to_be_bytes());
                    senc.extend_from_slice(&5u16.to_be_bytes());
                    senc.extend_from_slice(&3u32.to_be_bytes());
                }
                traf_children.push(full_box(b"senc", 0, 0x02, &senc));
            }
            mp4_box(
                b"moof",
                &[full_box(b"mfhd", 0, 0, &be32(&[sequence])), mp4_box(b"traf", &traf_children.concat())]
                    .concat(),
            )
        };
        let moof_len = build(0).len() as u32;
        [build(moof_len + 8), mp4_box(b"mdat", &mdat_payload)].concat()
    }

    fn open(data: Vec<u8>) -> Mp4Engine {
        let mut engine = Mp4Engine::new();
        engine
            .open_input(DataSource::pull(MemorySource::new(data)), &DemuxerConfig::default())
            .unwrap();
        engine.find_stream_info().unwrap();
        engine
    }

    #[test]
    fn test_fragmented_stream() {
        let data = [
            init_segment(false),
            media_segment(1, 0, 3, false),
            media_segment(2, 3 * 3600, 2, false),
        ]
        .concat();
        let mut engine = open(data);
        let stream = &engine.streams()[0];
        assert_eq!(stream.codec, Codec::H264);
        assert_eq!((stream.width, stream.height), (640, 360));
        assert_eq!(engine.duration(), Some(Duration::from_secs(4)));

        let mut frames = Vec::new();
        while let Some(frame) = engine.read_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 5);
        let dts: Vec<i64> = frames.iter().filter_map(|f| f.dts).collect();
        assert_eq!(dts, vec![0, 3600, 7200, 10800, 14400]);
        assert!(frames[0].key_frame && !frames[1].key_frame && frames[3].key_frame);
        assert_eq!(&frames[1].data[..], &[0, 0, 0, 4, 0x41, 1, 0xAB, 0xCD]);
        assert!(frames.iter().all(|f| f.encryption.is_none()));
    }

    #[test]
    fn test_protected_fragment_carries_encryption() {
        let data = [init_segment(true), media_segment(1, 0, 2, true)].concat();
        let mut engine = open(data);
        let stream = &engine.streams()[0];
        assert_eq!(stream.encryption_init.len(), 1);
        assert_eq!(stream.encryption_init[0].key_ids, vec![KeyId(KID)]);

        let frame = engine.read_frame().unwrap().unwrap();
        let encryption = frame.encryption.unwrap();
        assert_eq!(encryption.key_id, KeyId(KID));
        assert_eq!(&encryption.iv[..], &[0u8; 8]);
        assert_eq!(encryption.subsamples.len(), 1);
        assert_eq!(encryption.subsamples[0].clear_bytes, 5);
    }

    #[test]
    fn test_seek_fragmented_back_to_keyframe() {
        let data = [
            init_segment(false),
            media_segment(1, 0, 3, false),
            media_segment(2, 3 * 3600, 3, false),
        ]
        .concat();
        let mut engine = open(data);
        engine.seek_frame(0, 4 * 3600, true).unwrap();
        let frame = engine.read_frame().unwrap().unwrap();
        assert_eq!(frame.dts, Some(3 * 3600));
        assert!(frame.key_frame);
    }

    #[test]
    fn test_fragment_before_movie_header() {
        let mut engine = Mp4Engine::new();
        engine
            .open_input(
                DataSource::pull(MemorySource::new(media_segment(1, 0, 1, false))),
                &DemuxerConfig::default(),
            )
            .unwrap();
        assert!(matches!(engine.find_stream_info(), Err(DemuxerError::StreamInfo(_))));
    }
}
