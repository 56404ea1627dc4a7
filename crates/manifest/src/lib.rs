//! # Manifest
//!
//! Loads DASH MPDs and HLS playlists into one format-neutral
//! [`ManifestDocument`] and turns its representations into segment requests.
//!
//! ## Features
//!
//! - [`ManifestManager`]: single-flight reloading of live documents with an
//!   atomically swapped current document
//! - DASH (`quick-xml`) and HLS (`m3u8-rs`) parsers behind [`ManifestParser`]
//! - Template, list, single-resource and playlist segment addressing
//! - Bandwidth based representation selection
//! - [`SegmentLoader`]: ranged segment downloads with retries and HLS
//!   AES-128 decryption
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod config;
pub mod dash;
pub mod decryption;
pub mod document;
pub mod error;
pub mod fetcher;
pub mod format;
pub mod hls;
pub mod loader;
pub mod manager;
pub mod segments;
pub mod selection;

pub use config::{ManifestConfig, ManifestConfigBuilder};
pub use dash::DashParser;
pub use document::{
    AdaptationSet, ByteRange, ContentProtection, ContentType, DownloadTiming, ManifestDocument,
    MediaPlaylist, Period, PlaylistSegment, Representation, SegmentAddressing, SegmentKey,
    SegmentList, SegmentTemplate, SegmentUrl, SegmentUrlRef, SingleSegment, TimelineEntry,
};
pub use error::ManifestError;
pub use fetcher::{HttpManifestFetcher, ManifestFetcher};
pub use format::{ManifestFormat, ManifestParser, parse_manifest};
pub use hls::HlsParser;
pub use loader::{SegmentFetcher, SegmentLoader};
pub use manager::{ManifestManager, ReloadOutcome};
pub use segments::SegmentRequest;
pub use selection::RepresentationSelectionPolicy;

pub type Result<T> = std::result::Result<T, ManifestError>;
