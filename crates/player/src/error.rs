use std::sync::Arc;
use std::time::Duration;

use demux::DemuxerError;
use drm::DrmError;
use manifest::ManifestError;
use media_packet::StreamType;
use thiserror::Error;

use crate::{PlayerState, SubmitResult};

/// Errors of the packet synchronizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Synchronizer is closed")]
    Closed,
}

/// Errors that abort the packet pushing loop.
#[derive(Error, Debug, Clone)]
pub enum RendererError {
    /// The sink answered a submission with something the renderer has no
    /// policy for
    #[error("Unhandled sink result {result:?} for {stream_type} packet at {pts:?}")]
    UnhandledSubmitResult {
        result: SubmitResult,
        stream_type: StreamType,
        pts: Duration,
    },

    #[error("Packets are already being pushed")]
    AlreadyPushing,

    #[error("Synchronizer error: {0}")]
    Sync(#[from] SyncError),

    #[error("DRM error: {0}")]
    Drm(#[from] DrmError),
}

/// Errors reported by the player controller and its data providers.
///
/// Cloneable so it can be broadcast to every observer.
#[derive(Error, Debug, Clone)]
pub enum PlayerError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: PlayerState,
    },

    #[error("No source is set")]
    NoSource,

    #[error("Clip has no playable audio or video stream")]
    NoStreams,

    #[error("Unsupported clip: {0}")]
    UnsupportedClip(String),

    #[error("Demuxer error: {0}")]
    Demuxer(Arc<DemuxerError>),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("DRM error: {0}")]
    Drm(#[from] DrmError),

    #[error("Renderer error: {0}")]
    Renderer(#[from] RendererError),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<DemuxerError> for PlayerError {
    fn from(err: DemuxerError) -> Self {
        PlayerError::Demuxer(Arc::new(err))
    }
}

impl From<SyncError> for PlayerError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Cancelled => PlayerError::Cancelled,
            other => PlayerError::Renderer(RendererError::Sync(other)),
        }
    }
}

impl From<tokio::task::JoinError> for PlayerError {
    fn from(err: tokio::task::JoinError) -> Self {
        PlayerError::Task(err.to_string())
    }
}
