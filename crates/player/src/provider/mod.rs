//! Data providers turn a clip definition into packets flowing into a
//! [`StreamRenderer`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drm::DrmDescription;
use media_packet::{DrmInitData, StreamConfig};
use playback_common::PlaybackContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::{PlayerConfig, PlayerError, StreamRenderer, TimelineSegment};

pub mod manifest;
pub mod progressive;

pub use self::manifest::ManifestDataProvider;
pub use self::progressive::ProgressiveDataProvider;

/// How a clip is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipKind {
    /// DASH manifest
    Dash,
    /// HLS master or media playlist
    Hls,
    /// A single seekable container file, local or over HTTP
    Progressive,
    /// An unbounded container stream; not seekable
    Stream,
}

impl ClipKind {
    /// Guesses the kind from the URL path.
    pub fn detect(url: &str) -> ClipKind {
        let path = Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".mpd") {
            ClipKind::Dash
        } else if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            ClipKind::Hls
        } else {
            ClipKind::Progressive
        }
    }
}

impl fmt::Display for ClipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClipKind::Dash => "dash",
            ClipKind::Hls => "hls",
            ClipKind::Progressive => "progressive",
            ClipKind::Stream => "stream",
        })
    }
}

impl FromStr for ClipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dash" => Ok(ClipKind::Dash),
            "hls" => Ok(ClipKind::Hls),
            "progressive" => Ok(ClipKind::Progressive),
            "stream" => Ok(ClipKind::Stream),
            other => Err(format!("unknown clip kind: {other}")),
        }
    }
}

/// What to play.
#[derive(Debug, Clone)]
pub struct ClipDefinition {
    pub url: String,
    /// Detected from the URL when `None`
    pub kind: Option<ClipKind>,
    pub drm: Vec<DrmDescription>,
}

impl ClipDefinition {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: None,
            drm: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: ClipKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_drm(mut self, description: DrmDescription) -> Self {
        self.drm.push(description);
        self
    }

    pub fn kind(&self) -> ClipKind {
        self.kind.unwrap_or_else(|| ClipKind::detect(&self.url))
    }
}

/// A provider's description of the clip once its streams are known.
#[derive(Debug, Clone)]
pub struct PreparedClip {
    pub streams: Vec<StreamConfig>,
    pub drm_init_data: Vec<DrmInitData>,
    pub duration: Option<Duration>,
    pub seekable: bool,
    /// Mapping of container timestamps onto the playback timeline
    pub segment: TimelineSegment,
    /// Playback time of the first packet, where the clock starts
    pub start_position: Duration,
}

/// Source of packets for one clip.
///
/// `prepare` runs once and must succeed before `start`. Fatal errors of
/// background work after `start` are reported on the channel given to it.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn kind(&self) -> ClipKind;

    async fn prepare(&self, token: &CancellationToken) -> Result<PreparedClip, PlayerError>;

    /// Starts feeding packets into `renderer`.
    async fn start(
        &self,
        renderer: Arc<StreamRenderer>,
        fatal: mpsc::UnboundedSender<PlayerError>,
    ) -> Result<(), PlayerError>;

    /// Repositions the input. Everything queued before the call is flushed
    /// from the renderer before packets of the new position arrive. Returns
    /// the timeline mapping of the new position.
    async fn seek(&self, position: Duration) -> Result<TimelineSegment, PlayerError>;

    /// Stops all background work. The provider cannot be restarted.
    async fn stop(&self);

    fn duration(&self) -> Option<Duration>;
}

/// Creates the provider matching a clip's kind.
#[derive(Debug, Clone)]
pub struct DataProviderFactory {
    config: PlayerConfig,
    context: Arc<PlaybackContext>,
}

impl DataProviderFactory {
    pub fn new(config: PlayerConfig, context: Arc<PlaybackContext>) -> Self {
        Self { config, context }
    }

    pub fn create(&self, clip: &ClipDefinition) -> Result<Box<dyn DataProvider>, PlayerError> {
        let kind = clip.kind();
        info!(url = %clip.url, %kind, "Creating data provider");
        match kind {
            ClipKind::Dash | ClipKind::Hls => {
                let url = Url::parse(&clip.url)
                    .map_err(|e| PlayerError::UnsupportedClip(format!("invalid manifest url {}: {e}", clip.url)))?;
                Ok(Box::new(ManifestDataProvider::http(
                    kind,
                    url,
                    self.config.clone(),
                    self.context.clone(),
                )))
            }
            ClipKind::Progressive | ClipKind::Stream => Ok(Box::new(ProgressiveDataProvider::new(
                clip.url.clone(),
                kind == ClipKind::Stream,
                !clip.drm.is_empty(),
                self.config.clone(),
                self.context.clone(),
            ))),
        }
    }
}

/// Spawns background work whose failure is fatal for playback. Errors after
/// cancellation are expected teardown noise and dropped.
pub(crate) fn spawn_supervised<F>(
    name: &'static str,
    work: F,
    fatal: mpsc::UnboundedSender<PlayerError>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), PlayerError>> + Send + 'static,
{
    tokio::spawn(async move {
        match work.await {
            Ok(()) => debug!(task = name, "Task finished"),
            Err(_) if token.is_cancelled() => debug!(task = name, "Task stopped"),
            Err(e) => {
                error!(task = name, error = %e, "Task failed");
                let _ = fatal.send(e);
            }
        }
    })
}

/// Awaits stopped tasks, aborting any that outlive `grace`.
pub(crate) async fn join_all(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    for mut task in tasks {
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }
}
