//! Format-neutral manifest document.
//!
//! Both DASH MPDs and HLS playlists are mapped onto the same tree:
//! periods contain adaptation sets, adaptation sets contain interchangeable
//! representations, and each representation says how its segments are
//! addressed.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use media_packet::{KeyId, StreamType, SystemId};
use url::Url;

use crate::ManifestFormat;

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDocument {
    /// URL the document was loaded from
    pub url: Url,
    pub format: ManifestFormat,
    /// Live documents change over time and must be reloaded
    pub dynamic: bool,
    pub minimum_update_period: Option<Duration>,
    pub media_presentation_duration: Option<Duration>,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub suggested_presentation_delay: Option<Duration>,
    pub periods: Vec<Period>,
    pub timing: DownloadTiming,
}

/// When the document was requested, received and parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadTiming {
    pub requested: Option<DateTime<Utc>>,
    pub downloaded: Option<DateTime<Utc>>,
    pub parsed: Option<DateTime<Utc>>,
}

impl ManifestDocument {
    pub fn new(url: Url, format: ManifestFormat) -> Self {
        Self {
            url,
            format,
            dynamic: false,
            minimum_update_period: None,
            media_presentation_duration: None,
            availability_start_time: None,
            time_shift_buffer_depth: None,
            suggested_presentation_delay: None,
            periods: Vec::new(),
            timing: DownloadTiming::default(),
        }
    }

    /// Duration of a period: its own, else up to the next period's start,
    /// else up to the end of the presentation.
    pub fn period_duration(&self, index: usize) -> Option<Duration> {
        let period = self.periods.get(index)?;
        if let Some(duration) = period.duration {
            return Some(duration);
        }
        if let Some(next) = self.periods.get(index + 1) {
            return Some(next.start.saturating_sub(period.start));
        }
        self.media_presentation_duration
            .map(|total| total.saturating_sub(period.start))
    }

    /// Every adaptation set of the first period carrying the given stream type.
    pub fn adaptation_sets(&self, stream_type: StreamType) -> impl Iterator<Item = &AdaptationSet> {
        self.periods
            .first()
            .into_iter()
            .flat_map(|p| p.adaptation_sets.iter())
            .filter(move |a| a.content_type.stream_type() == Some(stream_type))
    }

    /// Content protections declared anywhere in the document.
    pub fn content_protections(&self) -> impl Iterator<Item = &ContentProtection> {
        self.periods
            .iter()
            .flat_map(|p| p.adaptation_sets.iter())
            .flat_map(|a| a.content_protections.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: Option<String>,
    /// Start relative to the presentation start
    pub start: Duration,
    pub duration: Option<Duration>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Video,
    Audio,
    Text,
    Unknown,
}

impl ContentType {
    pub fn stream_type(&self) -> Option<StreamType> {
        match self {
            ContentType::Video => Some(StreamType::Video),
            ContentType::Audio => Some(StreamType::Audio),
            ContentType::Text => Some(StreamType::Subtitle),
            ContentType::Unknown => None,
        }
    }

    /// Classifies a `contentType` value, a mime type or a codecs string.
    pub fn infer(value: &str) -> ContentType {
        let value = value.to_ascii_lowercase();
        if value.starts_with("video") || value.starts_with("avc") || value.starts_with("hvc") || value.starts_with("hev") {
            ContentType::Video
        } else if value.starts_with("audio") || value.starts_with("mp4a") || value.starts_with("ac-3") || value.starts_with("ec-3") {
            ContentType::Audio
        } else if value.starts_with("text") || value.contains("ttml") || value.contains("vtt") || value.starts_with("stpp") {
            ContentType::Text
        } else {
            ContentType::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub content_type: ContentType,
    pub mime_type: Option<String>,
    pub language: Option<String>,
    pub content_protections: Vec<ContentProtection>,
    pub representations: Vec<Representation>,
}

/// A `ContentProtection` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentProtection {
    pub scheme_id_uri: String,
    pub value: Option<String>,
    pub default_kid: Option<KeyId>,
    /// Raw `pssh` box carried in the descriptor
    pub pssh: Option<Bytes>,
}

impl ContentProtection {
    /// Protection system addressed by a `urn:uuid:` scheme.
    pub fn system_id(&self) -> Option<SystemId> {
        let uuid = self
            .scheme_id_uri
            .strip_prefix("urn:uuid:")
            .or_else(|| self.scheme_id_uri.strip_prefix("urn:UUID:"))?;
        SystemId::parse(uuid).ok()
    }

    /// The generic `mp4protection` descriptor announcing the scheme.
    pub fn is_mp4_protection(&self) -> bool {
        self.scheme_id_uri.eq_ignore_ascii_case("urn:mpeg:dash:mp4protection:2011")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub audio_sampling_rate: Option<u32>,
    /// Resolved base URL for relative segment references
    pub base_url: Url,
    pub addressing: SegmentAddressing,
}

/// Inclusive byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Parses the DASH `first-last` form.
    pub fn parse(value: &str) -> Option<ByteRange> {
        let (start, end) = value.trim().split_once('-')?;
        let range = ByteRange {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
        };
        (range.end >= range.start).then_some(range)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentAddressing {
    /// `SegmentTemplate`, numbered or timeline based
    Template(SegmentTemplate),
    /// `SegmentList` of explicit URLs
    List(SegmentList),
    /// The whole `BaseURL` resource is one segment
    Single(SingleSegment),
    /// HLS media playlist
    Playlist(MediaPlaylist),
    /// HLS variant whose media playlist has not been loaded yet
    PlaylistRef(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Start time, continuing from the previous entry when absent
    pub t: Option<u64>,
    pub d: u64,
    /// Repeat count; negative repeats until the next entry or the period end
    pub r: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTemplate {
    pub initialization: Option<String>,
    pub media: Option<String>,
    pub start_number: u64,
    pub timescale: u64,
    pub duration: Option<u64>,
    pub timeline: Vec<TimelineEntry>,
    pub presentation_time_offset: u64,
}

impl Default for SegmentTemplate {
    fn default() -> Self {
        Self {
            initialization: None,
            media: None,
            start_number: 1,
            timescale: 1,
            duration: None,
            timeline: Vec::new(),
            presentation_time_offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUrl {
    pub url: Option<String>,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentList {
    pub initialization: Option<SegmentUrl>,
    pub timescale: u64,
    pub duration: Option<u64>,
    pub start_number: u64,
    pub segments: Vec<SegmentUrl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleSegment {
    pub url: Url,
    /// Byte range of the initialization data inside the resource
    pub initialization: Option<ByteRange>,
}

/// HLS `EXT-X-KEY` in effect for a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKey {
    Aes128 { uri: Url, iv: Option<[u8; 16]> },
    SampleAes { uri: Option<Url>, key_format: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSegment {
    pub url: Url,
    pub duration: Duration,
    pub byte_range: Option<ByteRange>,
    /// `EXT-X-MAP` initialization section
    pub init: Option<SegmentUrlRef>,
    pub key: Option<SegmentKey>,
    pub discontinuity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentUrlRef {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    pub target_duration: Duration,
    pub end_list: bool,
    pub segments: Vec<PlaylistSegment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range() {
        let range = ByteRange::parse("100-199").unwrap();
        assert_eq!(range.len(), 100);
        assert_eq!(range.header_value(), "bytes=100-199");
        assert!(ByteRange::parse("9-3").is_none());
        assert!(ByteRange::parse("abc").is_none());
    }

    #[test]
    fn test_content_type_inference() {
        assert_eq!(ContentType::infer("video/mp4"), ContentType::Video);
        assert_eq!(ContentType::infer("mp4a.40.2"), ContentType::Audio);
        assert_eq!(ContentType::infer("application/ttml+xml"), ContentType::Text);
        assert_eq!(ContentType::infer("image/jpeg"), ContentType::Unknown);
    }

    #[test]
    fn test_content_protection_system_id() {
        let protection = ContentProtection {
            scheme_id_uri: "urn:uuid:1077efec-c0b2-4d02-ace3-3c1e52e2fb4b".to_string(),
            value: None,
            default_kid: None,
            pssh: None,
        };
        assert_eq!(protection.system_id(), Some(SystemId::COMMON));
        assert!(!protection.is_mp4_protection());
    }

    #[test]
    fn test_period_duration_falls_back_to_presentation() {
        let mut doc = ManifestDocument::new(Url::parse("http://a/b.mpd").unwrap(), ManifestFormat::Dash);
        doc.media_presentation_duration = Some(Duration::from_secs(30));
        doc.periods = vec![
            Period { id: None, start: Duration::ZERO, duration: None, adaptation_sets: vec![] },
            Period { id: None, start: Duration::from_secs(10), duration: None, adaptation_sets: vec![] },
        ];
        assert_eq!(doc.period_duration(0), Some(Duration::from_secs(10)));
        assert_eq!(doc.period_duration(1), Some(Duration::from_secs(20)));
        assert_eq!(doc.period_duration(2), None);
    }
}
