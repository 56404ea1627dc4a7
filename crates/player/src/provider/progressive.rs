//! Single-file clips: a local file or one HTTP resource demuxed as it
//! downloads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use demux::{DataSource, Demuxer, SharedBuffer};
use futures::StreamExt;
use media_packet::StreamType;
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use reqwest::Client;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClipKind, DataProvider, PreparedClip, join_all, spawn_supervised};
use crate::{DemuxDriver, DriverCommand, DriverSettings, PlayerConfig, PlayerError, StreamRenderer, TimelineSegment};

/// Read data kept behind the demuxer of an unbounded stream.
const STREAM_RETENTION: usize = 4 * 1024 * 1024;

#[derive(Default)]
struct ProgressiveState {
    driver: Option<Arc<DemuxDriver>>,
    buffer: Option<SharedBuffer>,
    commands: Option<mpsc::Sender<DriverCommand>>,
    receiver: Option<mpsc::Receiver<DriverCommand>>,
    tasks: Vec<JoinHandle<()>>,
    segment: TimelineSegment,
    duration: Option<Duration>,
}

/// Plays one container resource.
///
/// HTTP resources stream into a [`SharedBuffer`] the demuxer reads from;
/// other URLs are opened as local files.
pub struct ProgressiveDataProvider {
    url: String,
    live: bool,
    /// Whether DRM descriptions came with the clip
    has_drm: bool,
    config: PlayerConfig,
    context: Arc<PlaybackContext>,
    token: CancellationToken,
    /// Why the download failed, reported instead of the demuxer's read error
    download_error: Arc<Mutex<Option<PlayerError>>>,
    state: Mutex<ProgressiveState>,
}

impl ProgressiveDataProvider {
    pub fn new(
        url: impl Into<String>,
        live: bool,
        has_drm: bool,
        config: PlayerConfig,
        context: Arc<PlaybackContext>,
    ) -> Self {
        Self {
            url: url.into(),
            live,
            has_drm,
            config,
            context,
            token: CancellationToken::new(),
            download_error: Arc::new(Mutex::new(None)),
            state: Mutex::new(ProgressiveState::default()),
        }
    }

    fn is_remote(&self) -> bool {
        let lower = self.url.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    fn open_source(&self) -> DataSource {
        if !self.is_remote() {
            return DataSource::Url(self.url.clone());
        }
        let buffer = if self.live {
            SharedBuffer::with_retention(STREAM_RETENTION)
        } else {
            SharedBuffer::new()
        };
        let reader = buffer.reader();

        let download = download(
            self.context.http.clone(),
            self.url.clone(),
            buffer.clone(),
            self.context.clone(),
            self.token.clone(),
        );
        let slot = self.download_error.clone();
        let failed = buffer.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = download.await {
                error!(error = %e, "Download failed");
                *slot.lock() = Some(e);
                failed.close();
            }
        });

        let mut state = self.state.lock();
        state.buffer = Some(buffer);
        state.tasks.push(task);
        DataSource::pull(reader)
    }

    fn explain(&self, e: PlayerError) -> PlayerError {
        self.download_error.lock().clone().unwrap_or(e)
    }
}

async fn download(
    client: Client,
    url: String,
    buffer: SharedBuffer,
    context: Arc<PlaybackContext>,
    token: CancellationToken,
) -> Result<(), PlayerError> {
    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        response = client.get(&url).send() => response
            .and_then(|r| r.error_for_status())
            .map_err(|e| PlayerError::Download(e.to_string()))?,
    };
    info!(url = %url, length = response.content_length(), "Download started");

    let mut stream = response.bytes_stream();
    let mut total = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                if !buffer.write(&bytes) {
                    debug!(url = %url, "Reader closed, download stopped");
                    return Ok(());
                }
                total += bytes.len() as u64;
                context.update_stats(|s| s.bytes_downloaded += bytes.len() as u64);
            }
            Some(Err(e)) => return Err(PlayerError::Download(e.to_string())),
            None => {
                buffer.finish();
                info!(url = %url, bytes = total, "Download finished");
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl DataProvider for ProgressiveDataProvider {
    fn kind(&self) -> ClipKind {
        if self.live { ClipKind::Stream } else { ClipKind::Progressive }
    }

    async fn prepare(&self, token: &CancellationToken) -> Result<PreparedClip, PlayerError> {
        let source = self.open_source();
        let mut driver = DemuxDriver::new(
            Demuxer::with_config(self.config.demuxer.clone()),
            DriverSettings::from_config(&self.config),
            self.context.clone(),
        );
        let info = driver.open(source, token).await.map_err(|e| self.explain(e))?;
        let prepared = driver.select_streams(&[StreamType::Video, StreamType::Audio])?;
        if prepared.configs.is_empty() {
            return Err(PlayerError::NoStreams);
        }

        let mut drm_init_data: Vec<_> = prepared.drm_init_data.into_iter().collect();
        if !drm_init_data.is_empty() && !self.has_drm {
            warn!(url = %self.url, "Clip is protected but has no DRM description, packets stay encrypted");
            driver.set_pass_through_encrypted(true);
            drm_init_data.clear();
        }

        let segment = TimelineSegment::new(Duration::ZERO, prepared.start_time.unwrap_or_default());
        let duration = prepared.duration.or(info.duration);
        let (commands, receiver) = mpsc::channel(4);
        {
            let mut state = self.state.lock();
            state.driver = Some(Arc::new(driver));
            state.commands = Some(commands);
            state.receiver = Some(receiver);
            state.segment = segment;
            state.duration = duration;
        }

        Ok(PreparedClip {
            streams: prepared.configs,
            drm_init_data,
            duration,
            seekable: !self.live,
            segment,
            start_position: Duration::ZERO,
        })
    }

    async fn start(
        &self,
        renderer: Arc<StreamRenderer>,
        fatal: mpsc::UnboundedSender<PlayerError>,
    ) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        let (Some(driver), Some(receiver)) = (state.driver.clone(), state.receiver.take()) else {
            return Err(PlayerError::NoSource);
        };
        renderer.synchronizer().set_active_streams(driver.stream_types());
        renderer.synchronizer().set_segment(state.segment);

        let token = self.token.clone();
        let slot = self.download_error.clone();
        let work = async move {
            driver
                .run(renderer, receiver, token)
                .await
                .map_err(|e| slot.lock().clone().unwrap_or(e))
        };
        state
            .tasks
            .push(spawn_supervised("progressive-demux", work, fatal, self.token.clone()));
        Ok(())
    }

    async fn seek(&self, position: Duration) -> Result<TimelineSegment, PlayerError> {
        if self.live {
            return Err(PlayerError::UnsupportedClip("live streams are not seekable".to_string()));
        }
        let (commands, segment) = {
            let state = self.state.lock();
            (state.commands.clone().ok_or(PlayerError::NoSource)?, state.segment)
        };

        let (reply, done) = oneshot::channel();
        commands
            .send(DriverCommand::Seek {
                position: segment.start + position,
                reply,
            })
            .await
            .map_err(|_| PlayerError::Task("demux driver stopped".to_string()))?;
        done.await
            .map_err(|_| PlayerError::Task("demux driver stopped".to_string()))??;
        Ok(segment)
    }

    async fn stop(&self) {
        self.token.cancel();
        let tasks = {
            let mut state = self.state.lock();
            if let Some(buffer) = state.buffer.take() {
                buffer.close();
            }
            state.commands = None;
            state.receiver = None;
            state.driver = None;
            std::mem::take(&mut state.tasks)
        };
        join_all(tasks, Duration::from_secs(2)).await;
        debug!(url = %self.url, "Progressive provider stopped");
    }

    fn duration(&self) -> Option<Duration> {
        self.state.lock().duration
    }
}

impl std::fmt::Debug for ProgressiveDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveDataProvider")
            .field("url", &self.url)
            .field("live", &self.live)
            .finish()
    }
}
