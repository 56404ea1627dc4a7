use std::fmt;

use tracing::debug;
use url::Url;

use crate::{DashParser, HlsParser, ManifestDocument, ManifestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestFormat {
    Dash,
    Hls,
}

impl ManifestFormat {
    /// Detects the format from the document body, falling back to the URL
    /// path extension.
    pub fn detect(content: &str, url: &Url) -> Option<ManifestFormat> {
        let head = content.trim_start_matches('\u{feff}').trim_start();
        if head.starts_with("#EXTM3U") {
            return Some(ManifestFormat::Hls);
        }
        if head.starts_with('<') && head.contains("<MPD") {
            return Some(ManifestFormat::Dash);
        }
        Self::from_url(url)
    }

    /// Format implied by the URL path extension alone.
    pub fn from_url(url: &Url) -> Option<ManifestFormat> {
        let path = url.path().to_ascii_lowercase();
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Some(ManifestFormat::Hls)
        } else if path.ends_with(".mpd") {
            Some(ManifestFormat::Dash)
        } else {
            None
        }
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestFormat::Dash => write!(f, "dash"),
            ManifestFormat::Hls => write!(f, "hls"),
        }
    }
}

/// Turns a downloaded manifest body into a [`ManifestDocument`].
pub trait ManifestParser: Send + Sync {
    fn format(&self) -> ManifestFormat;

    /// Parses `content`; relative references resolve against `url`.
    fn parse(&self, content: &str, url: &Url) -> Result<ManifestDocument>;
}

/// Detects the format of `content` and parses it with the matching parser.
pub fn parse_manifest(content: &str, url: &Url) -> Result<ManifestDocument> {
    let format = ManifestFormat::detect(content, url)
        .ok_or_else(|| ManifestError::UnsupportedFormat(format!("cannot detect the format of {url}")))?;
    debug!(%format, %url, len = content.len(), "Parsing manifest");
    match format {
        ManifestFormat::Dash => DashParser.parse(content, url),
        ManifestFormat::Hls => HlsParser.parse(content, url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_content_and_extension() {
        let url = Url::parse("http://cdn.test/live/stream").unwrap();
        assert_eq!(ManifestFormat::detect("#EXTM3U\n", &url), Some(ManifestFormat::Hls));
        assert_eq!(
            ManifestFormat::detect("\u{feff}<?xml version=\"1.0\"?>\n<MPD>", &url),
            Some(ManifestFormat::Dash)
        );
        assert_eq!(ManifestFormat::detect("garbage", &url), None);

        let mpd = Url::parse("http://cdn.test/a/Manifest.MPD?token=1").unwrap();
        assert_eq!(ManifestFormat::detect("", &mpd), Some(ManifestFormat::Dash));
        let m3u8 = Url::parse("http://cdn.test/a/index.m3u8").unwrap();
        assert_eq!(ManifestFormat::detect("", &m3u8), Some(ManifestFormat::Hls));
    }

    #[test]
    fn test_parse_unknown_format() {
        let url = Url::parse("http://cdn.test/clip.bin").unwrap();
        assert!(matches!(
            parse_manifest("hello", &url),
            Err(ManifestError::UnsupportedFormat(_))
        ));
    }
}
