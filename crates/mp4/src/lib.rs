//! ISO base media file format parsing for playback.
//!
//! Covers what a demuxer needs: the movie box of an init segment or a
//! progressive file (tracks, codec configuration, protection information,
//! sample tables) and movie fragments (`moof`) with per-sample encryption.

pub mod error;
pub mod fragment;
pub mod init;
pub mod reader;
pub mod sample_table;

pub use error::Mp4Error;
pub use fragment::{Fragment, FragmentSample, SampleEncryption, TrackFragment};
pub use init::{HandlerType, InitSegment, SampleDescription, Track, TrackDefaults, TrackProtection};
pub use reader::{BoxHeader, Boxes, ByteReader, FourCc};
pub use sample_table::{Sample, SampleTable, SampleTableBuilder};

pub type Result<T> = std::result::Result<T, Mp4Error>;
