//! Lifecycle of the current manifest document.
//!
//! The manager owns the only visible [`ManifestDocument`] and decides when it
//! must be reloaded. A reload never fails towards the caller: download and
//! parse errors are logged and the previous document stays authoritative.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use playback_common::PlaybackContext;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    HttpManifestFetcher, ManifestConfig, ManifestDocument, ManifestError, ManifestFetcher,
    parse_manifest,
};

/// What a call to [`ManifestManager::reload_manifest`] did.
#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// A new document is now current
    Updated,
    /// Another reload was already in flight; nothing was fetched
    InProgress,
    DownloadFailed(ManifestError),
    ParseFailed(ManifestError),
    Cancelled,
}

impl ReloadOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, ReloadOutcome::Updated)
    }
}

#[derive(Debug, Default)]
struct ReloadTiming {
    /// When the last reload was requested
    last_request: Option<Instant>,
    /// `None` when the current document never needs reloading
    minimum_period: Option<Duration>,
}

pub struct ManifestManager {
    url: Url,
    fetcher: Arc<dyn ManifestFetcher>,
    context: Arc<PlaybackContext>,
    document: RwLock<Option<Arc<ManifestDocument>>>,
    timing: Mutex<ReloadTiming>,
    reload_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<CancellationToken>>,
    updates: watch::Sender<Option<Arc<ManifestDocument>>>,
}

impl ManifestManager {
    pub fn new(url: Url, fetcher: Arc<dyn ManifestFetcher>, context: Arc<PlaybackContext>) -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            url,
            fetcher,
            context,
            document: RwLock::new(None),
            timing: Mutex::new(ReloadTiming::default()),
            reload_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            updates,
        }
    }

    /// Manager fetching over HTTP with the context's shared client.
    pub fn http(url: Url, context: Arc<PlaybackContext>, config: &ManifestConfig) -> Self {
        let fetcher = Arc::new(HttpManifestFetcher::new(context.http.clone(), config));
        Self::new(url, fetcher, context)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// True before the first successful load, and for dynamic documents once
    /// the minimum update period has elapsed since the last reload request.
    pub fn needs_reload(&self) -> bool {
        let Some(document) = self.current_document() else {
            return true;
        };
        if !document.dynamic {
            return false;
        }
        let timing = self.timing.lock();
        match (timing.last_request, timing.minimum_period) {
            (Some(last), Some(period)) => last.elapsed() >= period,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }

    /// Time until [`needs_reload`](Self::needs_reload) turns true, `None` if
    /// it never will with the current document.
    pub fn time_until_reload(&self) -> Option<Duration> {
        let document = self.current_document()?;
        if !document.dynamic {
            return None;
        }
        let timing = self.timing.lock();
        let period = timing.minimum_period?;
        let elapsed = timing.last_request.map(|t| t.elapsed()).unwrap_or(period);
        Some(period.saturating_sub(elapsed))
    }

    /// Downloads and parses the manifest, then swaps the current document.
    ///
    /// Single flight: a call made while another is in progress returns
    /// [`ReloadOutcome::InProgress`] without fetching. Failures are logged
    /// and leave the previous document in place.
    pub async fn reload_manifest(&self) -> ReloadOutcome {
        let Ok(_guard) = self.reload_lock.try_lock() else {
            debug!(url = %self.url, "Manifest reload already in progress");
            return ReloadOutcome::InProgress;
        };

        let token = CancellationToken::new();
        *self.in_flight.lock() = Some(token.clone());
        let outcome = self.reload(&token).await;
        *self.in_flight.lock() = None;
        outcome
    }

    async fn reload(&self, token: &CancellationToken) -> ReloadOutcome {
        self.timing.lock().last_request = Some(Instant::now());
        let requested = Utc::now();
        debug!(url = %self.url, "Downloading manifest");

        let content = match self.fetcher.fetch(&self.url, token).await {
            Ok(content) => content,
            Err(ManifestError::Cancelled) => {
                info!(url = %self.url, "Manifest download cancelled");
                return ReloadOutcome::Cancelled;
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Manifest download failed");
                self.context.update_stats(|s| s.manifest_failures += 1);
                return ReloadOutcome::DownloadFailed(e);
            }
        };
        let downloaded = Utc::now();

        let mut document = match parse_manifest(&content, &self.url) {
            Ok(document) => document,
            Err(e) => {
                error!(url = %self.url, error = %e, "Manifest parse failed");
                self.context.update_stats(|s| s.manifest_failures += 1);
                return ReloadOutcome::ParseFailed(e);
            }
        };
        if token.is_cancelled() {
            info!(url = %self.url, "Manifest reload cancelled after parse");
            return ReloadOutcome::Cancelled;
        }

        document.timing.requested = Some(requested);
        document.timing.downloaded = Some(downloaded);
        document.timing.parsed = Some(Utc::now());
        let minimum_period = if document.dynamic {
            document.minimum_update_period
        } else {
            None
        };

        info!(
            url = %self.url,
            format = %document.format,
            dynamic = document.dynamic,
            periods = document.periods.len(),
            minimum_update_period = ?minimum_period,
            "Manifest loaded"
        );

        let document = Arc::new(document);
        *self.document.write() = Some(document.clone());
        self.timing.lock().minimum_period = minimum_period;
        self.context.update_stats(|s| {
            s.manifest_reloads += 1;
            if s.duration.is_none() {
                s.duration = document.media_presentation_duration;
            }
        });
        self.updates.send_replace(Some(document));
        ReloadOutcome::Updated
    }

    /// Cancels the in-flight reload, if any.
    pub fn cancel_reload(&self) {
        if let Some(token) = self.in_flight.lock().as_ref() {
            debug!(url = %self.url, "Cancelling manifest reload");
            token.cancel();
        }
    }

    pub fn current_document(&self) -> Option<Arc<ManifestDocument>> {
        self.document.read().clone()
    }

    /// Receiver notified with every newly loaded document.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ManifestDocument>>> {
        self.updates.subscribe()
    }
}

impl std::fmt::Debug for ManifestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestManager")
            .field("url", &self.url.as_str())
            .field("loaded", &self.document.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use playback_common::create_test_context;

    use super::*;
    use crate::Result;

    const STATIC_MPD: &str = r#"<MPD type="static" mediaPresentationDuration="PT10S"><Period/></MPD>"#;
    const DYNAMIC_MPD: &str = r#"<MPD type="dynamic" minimumUpdatePeriod="PT5S"
        availabilityStartTime="2024-01-01T00:00:00Z"><Period/></MPD>"#;

    /// Serves scripted bodies after an optional delay and counts fetches.
    struct ScriptedFetcher {
        bodies: Mutex<Vec<Result<String>>>,
        delay: Duration,
        fetches: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(bodies: Vec<Result<String>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(bodies),
                delay,
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManifestFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &Url, token: &CancellationToken) -> Result<String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = token.cancelled() => return Err(ManifestError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            let mut bodies = self.bodies.lock();
            if bodies.is_empty() {
                return Err(ManifestError::Timeout(Duration::from_secs(3)));
            }
            bodies.remove(0)
        }
    }

    fn manager(fetcher: Arc<ScriptedFetcher>) -> ManifestManager {
        ManifestManager::new(
            Url::parse("http://cdn.test/manifest.mpd").unwrap(),
            fetcher,
            create_test_context(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_document_reloads_once() {
        let fetcher = ScriptedFetcher::new(vec![Ok(STATIC_MPD.to_string())], Duration::ZERO);
        let manager = manager(fetcher.clone());

        assert!(manager.needs_reload());
        assert!(manager.reload_manifest().await.is_updated());
        assert!(!manager.needs_reload());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!manager.needs_reload());
        assert_eq!(manager.time_until_reload(), None);
        assert_eq!(fetcher.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_document_reload_period() {
        let fetcher = ScriptedFetcher::new(vec![Ok(DYNAMIC_MPD.to_string())], Duration::ZERO);
        let manager = manager(fetcher);

        assert!(manager.reload_manifest().await.is_updated());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!manager.needs_reload());
        assert_eq!(manager.time_until_reload(), Some(Duration::from_secs(3)));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(manager.needs_reload());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reloads_fetch_once() {
        let fetcher = ScriptedFetcher::new(
            vec![Ok(STATIC_MPD.to_string()), Ok(STATIC_MPD.to_string())],
            Duration::from_millis(500),
        );
        let manager = manager(fetcher.clone());

        let (first, second) = tokio::join!(manager.reload_manifest(), manager.reload_manifest());
        assert!(first.is_updated());
        assert!(matches!(second, ReloadOutcome::InProgress));
        assert_eq!(fetcher.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_previous_document() {
        let fetcher = ScriptedFetcher::new(
            vec![
                Ok(DYNAMIC_MPD.to_string()),
                Err(ManifestError::HttpStatus {
                    url: "http://cdn.test/manifest.mpd".to_string(),
                    status: 503,
                }),
                Ok("<MPD><Period></MPD>".to_string()),
            ],
            Duration::ZERO,
        );
        let manager = manager(fetcher);
        let mut updates = manager.subscribe();

        assert!(manager.reload_manifest().await.is_updated());
        assert!(updates.has_changed().unwrap());
        let loaded = updates.borrow_and_update().clone().unwrap();

        assert!(matches!(manager.reload_manifest().await, ReloadOutcome::DownloadFailed(_)));
        assert!(matches!(manager.reload_manifest().await, ReloadOutcome::ParseFailed(_)));

        let current = manager.current_document().unwrap();
        assert!(Arc::ptr_eq(&current, &loaded));
        assert!(!updates.has_changed().unwrap());
        let stats = manager.context.stats_snapshot();
        assert_eq!(stats.manifest_reloads, 1);
        assert_eq!(stats.manifest_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reload() {
        let fetcher = ScriptedFetcher::new(vec![Ok(STATIC_MPD.to_string())], Duration::from_secs(60));
        let manager = manager(fetcher);

        let reload = manager.reload_manifest();
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            manager.cancel_reload();
        };
        let (outcome, ()) = tokio::join!(reload, cancel);
        assert!(matches!(outcome, ReloadOutcome::Cancelled));
        assert!(manager.current_document().is_none());
        assert!(manager.needs_reload());

        // Cancelling with nothing in flight is a no-op
        manager.cancel_reload();
    }
}
