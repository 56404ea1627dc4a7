use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading, parsing or addressing a manifest.
///
/// Cloneable so a failed reload can be reported to every observer.
#[derive(Error, Debug, Clone)]
pub enum ManifestError {
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported manifest format: {0}")]
    UnsupportedFormat(String),

    #[error("Manifest parse error: {0}")]
    Parse(String),

    #[error("Cannot address segments: {0}")]
    Addressing(String),

    #[error("Segment decryption error: {0}")]
    Decryption(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ManifestError {
    fn from(err: reqwest::Error) -> Self {
        ManifestError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<quick_xml::Error> for ManifestError {
    fn from(err: quick_xml::Error) -> Self {
        ManifestError::Parse(format!("XML: {err}"))
    }
}

impl From<quick_xml::events::attributes::AttrError> for ManifestError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        ManifestError::Parse(format!("XML attribute: {err}"))
    }
}

impl ManifestError {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        ManifestError::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
