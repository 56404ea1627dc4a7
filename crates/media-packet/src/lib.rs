//! # Media Packet
//!
//! Value types moved through the playback pipeline: demuxed packets (clear and
//! CENC-encrypted), stream configurations, DRM init data and the `pssh`
//! protection box codec used to carry it.
//!
//! Packets are single-owner values. The demuxer creates them, the DRM layer or
//! the renderer consumes them, and dropping one releases its buffer.
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
pub mod drm;
pub mod error;
pub mod packet;
pub mod pssh;
pub mod stream;

pub use config::{AudioStreamConfig, Codec, StreamConfig, VideoStreamConfig};
pub use drm::{DrmInitData, InitDataType, KeyId, SystemId};
pub use error::PacketError;
pub use packet::{
    EncryptedPacket, EncryptionPattern, EncryptionScheme, MediaPacket, Packet, Subsample,
};
pub use pssh::PsshBox;
pub use stream::StreamType;

pub type Result<T> = std::result::Result<T, PacketError>;
