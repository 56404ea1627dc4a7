use std::io;

use media_packet::PacketError;
use mp4::Mp4Error;
use thiserror::Error;
use ts::TsError;

#[derive(Error, Debug)]
pub enum DemuxerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport stream error: {0}")]
    Ts(#[from] TsError),

    #[error("MP4 error: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Demuxer is not open")]
    NotOpen,

    #[error("Demuxer is already open")]
    AlreadyOpen,

    #[error("Unsupported input: {0}")]
    UnsupportedFormat(String),

    #[error("Could not find stream information: {0}")]
    StreamInfo(String),

    #[error("Invalid stream index {0}")]
    InvalidStreamIndex(usize),

    #[error("Stream {0} is neither audio nor video")]
    UnsupportedStream(usize),

    #[error("Seek failed: {0}")]
    Seek(String),
}
