//! HLS playlist parser.
//!
//! A master playlist becomes one static period whose representations point
//! at their media playlists ([`SegmentAddressing::PlaylistRef`]); a media
//! playlist becomes one period with a single playlist-addressed
//! representation.

use std::collections::HashMap;
use std::time::Duration;

use m3u8_rs::{AlternativeMediaType, KeyMethod, MediaPlaylistType, Playlist};
use tracing::{debug, warn};
use url::Url;

use crate::{
    AdaptationSet, ByteRange, ContentType, ManifestDocument, ManifestError, ManifestFormat,
    ManifestParser, MediaPlaylist, Period, PlaylistSegment, Representation, Result,
    SegmentAddressing, SegmentKey, SegmentUrlRef,
};

/// Parser for HLS master and media playlists.
#[derive(Debug, Clone, Copy, Default)]
pub struct HlsParser;

impl ManifestParser for HlsParser {
    fn format(&self) -> ManifestFormat {
        ManifestFormat::Hls
    }

    fn parse(&self, content: &str, url: &Url) -> Result<ManifestDocument> {
        let playlist = m3u8_rs::parse_playlist_res(content.as_bytes())
            .map_err(|e| ManifestError::Parse(format!("Failed to parse M3U8: {e}")))?;
        match playlist {
            Playlist::MasterPlaylist(master) => from_master(master, url),
            Playlist::MediaPlaylist(media) => from_media(media, url),
        }
    }
}

fn join(base: &Url, uri: &str) -> Result<Url> {
    base.join(uri).map_err(|e| ManifestError::invalid_url(uri, e))
}

fn from_master(master: m3u8_rs::MasterPlaylist, url: &Url) -> Result<ManifestDocument> {
    let mut muxed = Vec::new();
    let mut audio_only = Vec::new();
    for (index, variant) in master.variants.iter().filter(|v| !v.is_i_frame).enumerate() {
        let playlist_url = join(url, &variant.uri)?;
        let representation = Representation {
            id: format!("variant-{index}"),
            bandwidth: variant.bandwidth,
            codecs: variant.codecs.clone(),
            mime_type: None,
            width: variant.resolution.as_ref().map(|r| r.width as u32),
            height: variant.resolution.as_ref().map(|r| r.height as u32),
            frame_rate: variant.frame_rate,
            audio_sampling_rate: None,
            base_url: playlist_url.clone(),
            addressing: SegmentAddressing::PlaylistRef(playlist_url),
        };
        let audio_codecs_only = variant.codecs.as_deref().is_some_and(|codecs| {
            codecs
                .split(',')
                .all(|c| ContentType::infer(c.trim()) == ContentType::Audio)
        });
        if audio_codecs_only {
            audio_only.push(representation);
        } else {
            muxed.push(representation);
        }
    }

    let mut adaptation_sets = Vec::new();
    if !muxed.is_empty() {
        // Variant streams usually carry audio next to video
        adaptation_sets.push(AdaptationSet {
            id: Some("variants".to_string()),
            content_type: ContentType::Video,
            mime_type: None,
            language: None,
            content_protections: Vec::new(),
            representations: muxed,
        });
    }
    if !audio_only.is_empty() {
        adaptation_sets.push(AdaptationSet {
            id: Some("audio-variants".to_string()),
            content_type: ContentType::Audio,
            mime_type: None,
            language: None,
            content_protections: Vec::new(),
            representations: audio_only,
        });
    }

    for media in &master.alternatives {
        let content_type = match media.media_type {
            AlternativeMediaType::Audio => ContentType::Audio,
            AlternativeMediaType::Subtitles => ContentType::Text,
            AlternativeMediaType::Video => ContentType::Video,
            _ => continue,
        };
        // Renditions without a URI are carried inside the variant streams
        let Some(uri) = media.uri.as_deref() else {
            continue;
        };
        let playlist_url = join(url, uri)?;
        adaptation_sets.push(AdaptationSet {
            id: Some(format!("{}/{}", media.group_id, media.name)),
            content_type,
            mime_type: None,
            language: media.language.clone(),
            content_protections: Vec::new(),
            representations: vec![Representation {
                id: media.name.clone(),
                bandwidth: 0,
                codecs: None,
                mime_type: None,
                width: None,
                height: None,
                frame_rate: None,
                audio_sampling_rate: None,
                base_url: playlist_url.clone(),
                addressing: SegmentAddressing::PlaylistRef(playlist_url),
            }],
        });
    }

    if adaptation_sets.is_empty() {
        return Err(ManifestError::Parse("master playlist has no variants".to_string()));
    }
    debug!(sets = adaptation_sets.len(), "Parsed HLS master playlist");

    let mut doc = ManifestDocument::new(url.clone(), ManifestFormat::Hls);
    doc.periods.push(Period {
        id: None,
        start: Duration::ZERO,
        duration: None,
        adaptation_sets,
    });
    Ok(doc)
}

fn from_media(media: m3u8_rs::MediaPlaylist, url: &Url) -> Result<ManifestDocument> {
    let mut segments = Vec::with_capacity(media.segments.len());
    let mut key: Option<SegmentKey> = None;
    let mut init: Option<SegmentUrlRef> = None;
    // Ranges without an offset continue where the previous range of the
    // same resource ended.
    let mut range_ends: HashMap<Url, u64> = HashMap::new();

    for segment in &media.segments {
        if let Some(segment_key) = &segment.key {
            key = parse_key(segment_key, url)?;
        }
        if let Some(map) = &segment.map {
            let map_url = join(url, &map.uri)?;
            let byte_range = map
                .byte_range
                .as_ref()
                .map(|r| resolve_range(r, &map_url, &mut range_ends));
            init = Some(SegmentUrlRef {
                url: map_url,
                byte_range,
            });
        }

        let segment_url = join(url, &segment.uri)?;
        let byte_range = segment
            .byte_range
            .as_ref()
            .map(|r| resolve_range(r, &segment_url, &mut range_ends));
        segments.push(PlaylistSegment {
            url: segment_url,
            duration: Duration::from_secs_f32(segment.duration.max(0.0)),
            byte_range,
            init: init.clone(),
            key: key.clone(),
            discontinuity: segment.discontinuity,
        });
    }

    let vod = media.end_list || matches!(media.playlist_type, Some(MediaPlaylistType::Vod));
    let target_duration = Duration::from_secs(media.target_duration);
    let total: Duration = segments.iter().map(|s| s.duration).sum();

    let mut doc = ManifestDocument::new(url.clone(), ManifestFormat::Hls);
    doc.dynamic = !vod;
    if vod {
        doc.media_presentation_duration = Some(total);
    } else {
        doc.minimum_update_period = Some(target_duration);
    }
    debug!(
        segments = segments.len(),
        media_sequence = media.media_sequence,
        dynamic = doc.dynamic,
        "Parsed HLS media playlist"
    );

    let representation = Representation {
        id: "media".to_string(),
        bandwidth: 0,
        codecs: None,
        mime_type: None,
        width: None,
        height: None,
        frame_rate: None,
        audio_sampling_rate: None,
        base_url: url.clone(),
        addressing: SegmentAddressing::Playlist(MediaPlaylist {
            media_sequence: media.media_sequence,
            target_duration,
            end_list: media.end_list,
            segments,
        }),
    };
    doc.periods.push(Period {
        id: None,
        start: Duration::ZERO,
        duration: vod.then_some(total),
        adaptation_sets: vec![AdaptationSet {
            id: None,
            content_type: ContentType::Unknown,
            mime_type: None,
            language: None,
            content_protections: Vec::new(),
            representations: vec![representation],
        }],
    });
    Ok(doc)
}

fn resolve_range(range: &m3u8_rs::ByteRange, url: &Url, ends: &mut HashMap<Url, u64>) -> ByteRange {
    let start = range
        .offset
        .unwrap_or_else(|| ends.get(url).copied().unwrap_or(0));
    let length = range.length.max(1);
    ends.insert(url.clone(), start + length);
    ByteRange {
        start,
        end: start + length - 1,
    }
}

fn parse_key(key: &m3u8_rs::Key, base: &Url) -> Result<Option<SegmentKey>> {
    match &key.method {
        KeyMethod::None => Ok(None),
        KeyMethod::AES128 => {
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| ManifestError::Parse("AES-128 key without URI".to_string()))?;
            let iv = key.iv.as_deref().map(parse_iv).transpose()?;
            Ok(Some(SegmentKey::Aes128 {
                uri: join(base, uri)?,
                iv,
            }))
        }
        KeyMethod::SampleAES => Ok(Some(SegmentKey::SampleAes {
            uri: key.uri.as_deref().map(|u| join(base, u)).transpose()?,
            key_format: key.keyformat.clone(),
        })),
        KeyMethod::Other(method) => {
            warn!(%method, "Unsupported EXT-X-KEY method");
            Err(ManifestError::Parse(format!("unsupported key method {method}")))
        }
    }
}

/// Parses a `0x`-prefixed hexadecimal IV.
pub(crate) fn parse_iv(value: &str) -> Result<[u8; 16]> {
    let hex_str = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let mut iv = [0u8; 16];
    hex::decode_to_slice(hex_str, &mut iv)
        .map_err(|e| ManifestError::Parse(format!("invalid IV {value}: {e}")))?;
    Ok(iv)
}
