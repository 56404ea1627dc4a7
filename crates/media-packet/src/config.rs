use bytes::Bytes;

use crate::StreamType;

/// Codec identity of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    H264,
    H265,
    Av1,
    Vp9,
    Mpeg2Video,
    Aac,
    Ac3,
    Eac3,
    Mp3,
    Opus,
    #[default]
    Unknown,
}

impl Codec {
    pub fn stream_type(&self) -> Option<StreamType> {
        match self {
            Codec::H264 | Codec::H265 | Codec::Av1 | Codec::Vp9 | Codec::Mpeg2Video => {
                Some(StreamType::Video)
            }
            Codec::Aac | Codec::Ac3 | Codec::Eac3 | Codec::Mp3 | Codec::Opus => {
                Some(StreamType::Audio)
            }
            Codec::Unknown => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::H264 => "video/avc",
            Codec::H265 => "video/hevc",
            Codec::Av1 => "video/av01",
            Codec::Vp9 => "video/x-vnd.on2.vp9",
            Codec::Mpeg2Video => "video/mpeg2",
            Codec::Aac => "audio/mp4a-latm",
            Codec::Ac3 => "audio/ac3",
            Codec::Eac3 => "audio/eac3",
            Codec::Mp3 => "audio/mpeg",
            Codec::Opus => "audio/opus",
            Codec::Unknown => "application/octet-stream",
        }
    }

    /// Maps an ISO-BMFF sample entry or `codecs=` attribute prefix.
    pub fn from_fourcc(fourcc: &str) -> Codec {
        match fourcc {
            "avc1" | "avc3" => Codec::H264,
            "hvc1" | "hev1" => Codec::H265,
            "av01" => Codec::Av1,
            "vp09" => Codec::Vp9,
            "mp4a" => Codec::Aac,
            "ac-3" => Codec::Ac3,
            "ec-3" => Codec::Eac3,
            "mp3" | ".mp3" => Codec::Mp3,
            "Opus" | "opus" => Codec::Opus,
            _ => Codec::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioStreamConfig {
    pub codec: Codec,
    pub stream_index: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_channel: u16,
    pub bitrate: u64,
    pub language: Option<String>,
    pub extra_data: Bytes,
}

#[derive(Debug, Clone)]
pub struct VideoStreamConfig {
    pub codec: Codec,
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub bitrate: u64,
    pub extra_data: Bytes,
}

/// Decoder configuration of one elementary stream.
///
/// Two configurations are equal when they describe the same stream type and
/// carry identical codec extra data; that is how mid-stream configuration
/// changes are detected.
#[derive(Debug, Clone)]
pub enum StreamConfig {
    Audio(AudioStreamConfig),
    Video(VideoStreamConfig),
}

impl StreamConfig {
    pub fn stream_type(&self) -> StreamType {
        match self {
            StreamConfig::Audio(_) => StreamType::Audio,
            StreamConfig::Video(_) => StreamType::Video,
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            StreamConfig::Audio(a) => a.codec,
            StreamConfig::Video(v) => v.codec,
        }
    }

    pub fn extra_data(&self) -> &Bytes {
        match self {
            StreamConfig::Audio(a) => &a.extra_data,
            StreamConfig::Video(v) => &v.extra_data,
        }
    }

    pub fn stream_index(&self) -> usize {
        match self {
            StreamConfig::Audio(a) => a.stream_index,
            StreamConfig::Video(v) => v.stream_index,
        }
    }

    pub fn bitrate(&self) -> u64 {
        match self {
            StreamConfig::Audio(a) => a.bitrate,
            StreamConfig::Video(v) => v.bitrate,
        }
    }
}

impl PartialEq for StreamConfig {
    fn eq(&self, other: &Self) -> bool {
        self.stream_type() == other.stream_type() && self.extra_data() == other.extra_data()
    }
}

impl Eq for StreamConfig {}
