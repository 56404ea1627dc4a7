use std::sync::Arc;

use media_packet::{KeyId, PacketError};
use thiserror::Error;

/// Errors raised by DRM sessions and sample decryption.
#[derive(Error, Debug, Clone)]
pub enum DrmError {
    /// Caller supplied configuration or data that can never work
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    #[error("License server rejected the request with HTTP {status}")]
    LicenseRejected { status: u16 },

    #[error("Invalid license response: {0}")]
    InvalidLicense(String),

    #[error("License transport error: {source}")]
    Transport {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("License request timed out")]
    Timeout,

    #[error("No key for {0}")]
    NoKey(KeyId),

    #[error("Sample layout is invalid: {0}")]
    InvalidSubsamples(#[from] PacketError),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("DRM session failed: {0}")]
    SessionFailed(String),

    #[error("Unsupported protection scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("DRM session manager is closed")]
    Closed,
}

impl From<reqwest::Error> for DrmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DrmError::Timeout
        } else {
            DrmError::Transport {
                source: Arc::new(err),
            }
        }
    }
}

impl DrmError {
    /// Errors caused by caller input rather than by the environment.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            DrmError::InvalidArgument(_) | DrmError::InvalidInitData(_)
        )
    }
}
