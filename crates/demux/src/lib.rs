//! # Demux
//!
//! Turns a byte source holding an MPEG-TS or ISO-BMFF container into
//! [`MediaPacket`](media_packet::MediaPacket)s.
//!
//! Container parsing sits behind the [`ContainerEngine`] trait. The
//! [`Demuxer`] owns exactly one engine for its whole life and is the only
//! thing that talks to it; everything the rest of the pipeline needs
//! (stream selection, configs, packets, DRM init data, seeking) goes through
//! the demuxer's methods.
//!
//! All calls block on the source and are meant to run on a blocking thread.

pub mod codec;
pub mod config;
pub mod demuxer;
pub mod engine;
pub mod error;
pub mod source;

pub use config::{DemuxerConfig, DemuxerConfigBuilder};
pub use demuxer::{ClipInfo, Demuxer};
pub use engine::{
    AnyEngine, ContainerEngine, EncryptionInitInfo, EngineFrame, EngineStream, FrameEncryption,
    IndexEntry, MediaType, Mp4Engine, Rational, TsEngine, VARIANT_BITRATE_TAG,
};
pub use error::DemuxerError;
pub use source::{DataSource, FileSource, MemorySource, PullSource, SharedBuffer, SharedBufferReader};

pub type Result<T> = std::result::Result<T, DemuxerError>;
