//! Container engine binding.
//!
//! An engine is a stateful, blocking parser over one [`DataSource`]. The
//! surface is deliberately narrow: open, probe, list streams, toggle
//! discard, read one frame, seek, close.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use bytes::Bytes;
use media_packet::{Codec, EncryptionPattern, EncryptionScheme, KeyId, StreamType, Subsample, SystemId};
use tracing::debug;

use crate::{DemuxerConfig, Result, source::DataSource};

mod any;
pub(crate) mod iso;
mod mpegts;
mod reader;

pub use any::AnyEngine;
pub use iso::Mp4Engine;
pub use mpegts::TsEngine;

/// Stream tag holding the bandwidth of the variant the stream belongs to.
pub const VARIANT_BITRATE_TAG: &str = "variant_bitrate";

/// Rational time base; a timestamp `t` lasts `t * num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Converts a timestamp to milliseconds, rounding toward zero.
    pub fn to_millis(&self, ts: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        ((ts as i128 * self.num as i128 * 1000) / self.den as i128) as i64
    }

    /// Converts milliseconds to a timestamp in this base.
    pub fn from_millis(&self, millis: i64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        ((millis as i128 * self.den as i128) / (self.num as i128 * 1000)) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
    Subtitle,
    Data,
}

impl MediaType {
    pub fn stream_type(&self) -> Option<StreamType> {
        match self {
            MediaType::Audio => Some(StreamType::Audio),
            MediaType::Video => Some(StreamType::Video),
            MediaType::Subtitle => Some(StreamType::Subtitle),
            MediaType::Data => None,
        }
    }
}

/// Protection system data attached to a stream, one per `pssh` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionInitInfo {
    pub system_id: SystemId,
    pub key_ids: Vec<KeyId>,
    pub data: Bytes,
}

/// Per-frame encryption parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEncryption {
    pub scheme: EncryptionScheme,
    pub key_id: KeyId,
    pub iv: Bytes,
    pub subsamples: Vec<Subsample>,
    pub pattern: Option<EncryptionPattern>,
}

/// Keyframe index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub timestamp: i64,
    pub position: u64,
}

#[derive(Debug, Clone)]
pub struct EngineStream {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: Codec,
    pub time_base: Rational,
    /// String tags such as `language` or `variant_bitrate`
    pub metadata: HashMap<String, String>,
    pub extra_data: Bytes,
    pub bitrate: u64,
    /// First decode timestamp, in `time_base` units
    pub first_dts: Option<i64>,
    /// Stream duration, in `time_base` units
    pub duration: Option<i64>,
    /// Keyframe index, ascending by timestamp
    pub index_entries: Vec<IndexEntry>,
    pub discard: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<Rational>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub encryption_init: Vec<EncryptionInitInfo>,
}

impl EngineStream {
    pub fn new(index: usize, media_type: MediaType, codec: Codec, time_base: Rational) -> Self {
        Self {
            index,
            media_type,
            codec,
            time_base,
            metadata: HashMap::new(),
            extra_data: Bytes::new(),
            bitrate: 0,
            first_dts: None,
            duration: None,
            index_entries: Vec::new(),
            discard: false,
            width: 0,
            height: 0,
            frame_rate: None,
            sample_rate: 0,
            channels: 0,
            bits_per_sample: 0,
            encryption_init: Vec::new(),
        }
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.media_type.stream_type()
    }

    pub fn language(&self) -> Option<&str> {
        self.metadata.get("language").map(String::as_str)
    }

    /// Applies tags that come from the configuration rather than the container.
    pub(crate) fn apply_config(&mut self, config: &DemuxerConfig) {
        if let Some(bitrate) = config.variant_bitrate {
            self.metadata
                .insert(VARIANT_BITRATE_TAG.to_string(), bitrate.to_string());
        }
    }

    /// Records a keyframe, keeping the index sorted and free of duplicates.
    pub(crate) fn add_index_entry(&mut self, timestamp: i64, position: u64) {
        let at = self.index_entries.partition_point(|e| e.timestamp < timestamp);
        if self.index_entries.get(at).is_some_and(|e| e.timestamp == timestamp) {
            return;
        }
        self.index_entries.insert(at, IndexEntry { timestamp, position });
    }
}

/// One demuxed frame, timestamps in the stream's time base.
#[derive(Debug, Clone)]
pub struct EngineFrame {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub key_frame: bool,
    pub data: Bytes,
    pub encryption: Option<FrameEncryption>,
}

/// Blocking container parser.
pub trait ContainerEngine: Send {
    /// Short format name for logs.
    fn name(&self) -> &'static str;

    fn open_input(&mut self, source: DataSource, config: &DemuxerConfig) -> Result<()>;

    /// Reads ahead until every stream is described or a probe limit is hit.
    /// Frames read while probing are kept and returned by `read_frame`.
    fn find_stream_info(&mut self) -> Result<()>;

    fn streams(&self) -> &[EngineStream];

    fn set_discard(&mut self, index: usize, discard: bool) -> Result<()>;

    /// Next frame of any non-discarded stream, `None` at end of input.
    fn read_frame(&mut self) -> Result<Option<EngineFrame>>;

    /// Repositions so the next frame of `stream_index` is the keyframe at or
    /// before (`backward`) or at or after `timestamp`.
    fn seek_frame(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()>;

    /// Container duration when known.
    fn duration(&self) -> Option<Duration>;

    /// Releases the input. Safe to call more than once.
    fn close(&mut self);
}

/// Exclusive owner of an engine that closes it on every exit path.
#[derive(Debug)]
pub(crate) struct EngineHandle<E: ContainerEngine> {
    engine: E,
    closed: bool,
}

impl<E: ContainerEngine> EngineHandle<E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine,
            closed: false,
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.closed {
            debug!(engine = self.engine.name(), "Closing container engine");
            self.engine.close();
            self.closed = true;
        }
    }
}

impl<E: ContainerEngine> Deref for EngineHandle<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.engine
    }
}

impl<E: ContainerEngine> DerefMut for EngineHandle<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: ContainerEngine> Drop for EngineHandle<E> {
    fn drop(&mut self) {
        self.close();
    }
}
