//! Playback context
//!
//! The context is built once by whoever starts playback and handed to every
//! component that needs configuration, statistics or the HTTP client. Nothing
//! in the pipeline reads process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;

use crate::{CommonError, HttpConfig, create_client};

/// Statistics collected while a clip plays
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    /// Manifest downloads that produced a new document
    pub manifest_reloads: u64,
    /// Manifest downloads or parses that failed
    pub manifest_failures: u64,
    /// Media segments fetched
    pub segments_downloaded: u64,
    /// Media bytes fetched
    pub bytes_downloaded: u64,
    /// Packets produced by demuxers
    pub packets_demuxed: u64,
    /// Packets decrypted before submission
    pub packets_decrypted: u64,
    /// Packets accepted by the sink
    pub packets_rendered: u64,
    /// Packets dropped because they arrived behind the output position
    pub packets_dropped_late: u64,
    /// Duration of the clip, when known
    pub duration: Option<Duration>,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

/// Shared context for one playback session
#[derive(Debug, Clone)]
pub struct PlaybackContext {
    /// Name of the session, used in log fields
    pub name: String,
    /// Runtime statistics
    pub statistics: Arc<Mutex<Statistics>>,
    /// Additional metadata properties
    pub metadata: Arc<Mutex<HashMap<String, String>>>,
    /// HTTP client shared by manifest, segment and license requests
    pub http: Client,
}

impl PlaybackContext {
    /// Create a context with a client built from the default [`HttpConfig`].
    pub fn new(name: impl Into<String>) -> Result<Self, CommonError> {
        Self::with_http_config(name, &HttpConfig::default())
    }

    pub fn with_http_config(name: impl Into<String>, config: &HttpConfig) -> Result<Self, CommonError> {
        Ok(Self::with_client(name, create_client(config)?))
    }

    pub fn with_client(name: impl Into<String>, http: Client) -> Self {
        Self {
            name: name.into(),
            statistics: Arc::new(Mutex::new(Statistics::default())),
            metadata: Arc::new(Mutex::new(HashMap::new())),
            http,
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Applies `f` to the statistics under the lock.
    pub fn update_stats(&self, f: impl FnOnce(&mut Statistics)) {
        f(&mut self.statistics.lock());
    }

    pub fn stats_snapshot(&self) -> Statistics {
        self.statistics.lock().clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.lock().insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_are_shared_between_clones() {
        let context = PlaybackContext::with_client("test", Client::new());
        let clone = context.clone();
        clone.update_stats(|s| s.packets_rendered += 3);
        context.update_stats(|s| s.packets_rendered += 1);
        assert_eq!(context.stats_snapshot().packets_rendered, 4);

        clone.set_metadata("clip", "a.mpd");
        assert_eq!(context.metadata("clip").as_deref(), Some("a.mpd"));
        assert_eq!(context.metadata("missing"), None);
    }
}
