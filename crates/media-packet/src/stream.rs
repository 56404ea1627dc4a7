use std::fmt;

/// Elementary stream kind of a packet or configuration.
///
/// The declaration order doubles as the tie-break order when two packets share
/// a playback time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    Audio,
    Video,
    Subtitle,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Audio, StreamType::Video, StreamType::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
            StreamType::Subtitle => "subtitle",
        }
    }

    /// Index into fixed per-type tables.
    pub fn index(&self) -> usize {
        match self {
            StreamType::Audio => 0,
            StreamType::Video => 1,
            StreamType::Subtitle => 2,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
