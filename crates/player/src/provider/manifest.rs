//! DASH and HLS clips.
//!
//! Every played adaptation set becomes a track. A track's segments are
//! fetched by a feeder task into a [`SharedBuffer`] that one demux driver
//! reads. Dynamic documents are reloaded in the background and feeders
//! pick up new segments as they appear.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use demux::{DataSource, Demuxer, DemuxerConfig, SharedBuffer};
use manifest::{
    AdaptationSet, ByteRange, ContentType, HttpManifestFetcher, ManifestDocument, ManifestError, ManifestFetcher,
    ManifestManager, Period, ReloadOutcome, Representation, SegmentAddressing, SegmentFetcher, SegmentLoader,
    SegmentRequest,
};
use media_packet::{DrmInitData, StreamType};
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ClipKind, DataProvider, PreparedClip, join_all, spawn_supervised};
use crate::driver::PreparedStreams;
use crate::{DemuxDriver, DriverSettings, PlayerConfig, PlayerError, StreamRenderer, TimelineSegment};

/// Live playback starts this many segments behind the newest one.
const LIVE_EDGE_SEGMENTS: usize = 3;

/// Read data kept behind the demuxer of a live track.
const LIVE_RETENTION: usize = 8 * 1024 * 1024;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// One representation being played and the document listing its segments.
#[derive(Debug)]
struct Track {
    manager: Arc<ManifestManager>,
    /// `None` follows the last period of the document
    period: Option<usize>,
    content_type: ContentType,
    representation_id: String,
    bandwidth: u64,
    wanted: Vec<StreamType>,
}

impl Track {
    fn period_index(&self, document: &ManifestDocument) -> Result<usize, PlayerError> {
        let count = document.periods.len();
        match self.period {
            Some(index) if index < count => Ok(index),
            None if count > 0 => Ok(count - 1),
            _ => Err(ManifestError::Addressing("document has no such period".to_string()).into()),
        }
    }

    fn representation<'a>(&self, period: &'a Period) -> Result<&'a Representation, PlayerError> {
        period
            .adaptation_sets
            .iter()
            .filter(|set| set.content_type == self.content_type)
            .flat_map(|set| set.representations.iter())
            .find(|r| r.id == self.representation_id)
            .ok_or_else(|| {
                ManifestError::Addressing(format!("representation {} is no longer listed", self.representation_id))
                    .into()
            })
    }

    fn requests(&self, document: &ManifestDocument) -> Result<Vec<SegmentRequest>, PlayerError> {
        let index = self.period_index(document)?;
        let representation = self.representation(&document.periods[index])?;
        Ok(document.segments(index, representation, Utc::now())?)
    }

    /// Timeline mapping for playback starting with `first`.
    ///
    /// Template addressing states the media time of the period start; other
    /// addressing relies on the first timestamp found in the container.
    fn timeline(
        &self,
        document: &ManifestDocument,
        first: Option<&SegmentRequest>,
        container_start: Option<Duration>,
    ) -> Result<TimelineSegment, PlayerError> {
        let index = self.period_index(document)?;
        let period = &document.periods[index];
        if let SegmentAddressing::Template(template) = &self.representation(period)?.addressing {
            let offset = template.presentation_time_offset as u128 * 1_000_000_000 / template.timescale.max(1) as u128;
            return Ok(TimelineSegment::new(period.start, Duration::from_nanos(offset as u64)));
        }
        let base = first.map_or(period.start, |r| r.start);
        let start = container_start.unwrap_or_else(|| base.saturating_sub(period.start));
        Ok(TimelineSegment::new(base, start))
    }
}

#[derive(Debug, Clone, Copy)]
enum StartAt {
    Beginning,
    Position(Duration),
    LiveEdge,
}

/// Progress of a feeder through a representation's segment list.
#[derive(Debug, Clone, Default, PartialEq)]
struct FeedCursor {
    /// First media segment number still to fetch; `None` takes the first listed
    next_number: Option<u64>,
    /// Initialization data already written
    last_init: Option<(Url, Option<ByteRange>)>,
}

impl FeedCursor {
    fn starting_at(requests: &[SegmentRequest], start: StartAt) -> Self {
        let media: Vec<&SegmentRequest> = requests.iter().filter(|r| !r.init).collect();
        let first = match start {
            StartAt::Beginning => None,
            StartAt::Position(position) => media
                .iter()
                .find(|r| r.end() > position)
                .or(media.last())
                .map(|r| r.number),
            StartAt::LiveEdge => media
                .len()
                .checked_sub(LIVE_EDGE_SEGMENTS)
                .and_then(|i| media.get(i))
                .map(|r| r.number),
        };
        Self {
            next_number: first,
            last_init: None,
        }
    }

    /// Requests still to fetch, each media segment preceded by its
    /// initialization data unless that was already written.
    fn pending(&self, requests: &[SegmentRequest]) -> Vec<SegmentRequest> {
        let mut pending = Vec::new();
        let mut init: Option<&SegmentRequest> = None;
        let mut last_init = self.last_init.clone();
        for request in requests {
            if request.init {
                init = Some(request);
                continue;
            }
            if self.next_number.is_some_and(|next| request.number < next) {
                continue;
            }
            if let Some(init) = init {
                let key = (init.url.clone(), init.byte_range);
                if last_init.as_ref() != Some(&key) {
                    pending.push(init.clone());
                    last_init = Some(key);
                }
            }
            pending.push(request.clone());
        }
        pending
    }

    fn advance(&mut self, request: &SegmentRequest) {
        if request.init {
            self.last_init = Some((request.url.clone(), request.byte_range));
        } else {
            self.next_number = Some(request.number + 1);
        }
    }
}

/// Writes a track's segments into the buffer its demuxer reads.
struct SegmentFeeder {
    track: Arc<Track>,
    fetcher: Arc<dyn SegmentFetcher>,
    buffer: SharedBuffer,
    cursor: FeedCursor,
}

impl SegmentFeeder {
    /// Feeds until done. A failure is reported before the buffer closes, so
    /// the demuxer's resulting read error can be traced back to it.
    async fn run(mut self, fatal: mpsc::UnboundedSender<PlayerError>, token: CancellationToken) {
        match self.feed(&token).await {
            Ok(()) => debug!(representation = %self.track.representation_id, "Feeder finished"),
            Err(e) => {
                if !token.is_cancelled() {
                    error!(representation = %self.track.representation_id, error = %e, "Segment feeding failed");
                    let _ = fatal.send(e);
                }
                self.buffer.close();
            }
        }
    }

    async fn feed(&mut self, token: &CancellationToken) -> Result<(), PlayerError> {
        let manager = self.track.manager.clone();
        let mut updates = manager.subscribe();
        updates.borrow_and_update();

        loop {
            let document = manager.current_document().ok_or(PlayerError::NoSource)?;
            let pending = self.cursor.pending(&self.track.requests(&document)?);
            for request in pending {
                match self.fetcher.fetch_segment(&request, token).await {
                    Ok(data) => {
                        if !self.buffer.write(&data) {
                            debug!(representation = %self.track.representation_id, "Buffer closed, feeder stopped");
                            return Ok(());
                        }
                    }
                    Err(ManifestError::Cancelled) => return Ok(()),
                    Err(e) if document.dynamic && !request.init => {
                        warn!(url = %request.url, number = request.number, error = %e, "Skipping live segment");
                    }
                    Err(e) => return Err(e.into()),
                }
                self.cursor.advance(&request);
            }

            if !document.dynamic || manager.time_until_reload().is_none() {
                debug!(representation = %self.track.representation_id, "All segments written");
                self.buffer.finish();
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                changed = updates.changed() => {
                    if changed.is_err() {
                        self.buffer.finish();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Reloads a dynamic document whenever its update period elapses.
async fn reload_loop(manager: Arc<ManifestManager>, token: CancellationToken) {
    loop {
        let Some(wait) = manager.time_until_reload() else {
            debug!(url = %manager.url(), "Document needs no further reloads");
            return;
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                manager.cancel_reload();
                return;
            }
            outcome = manager.reload_manifest() => outcome,
        };
        match outcome {
            ReloadOutcome::Updated => debug!(url = %manager.url(), "Document reloaded"),
            ReloadOutcome::InProgress => {}
            other => warn!(url = %manager.url(), outcome = ?other, "Document reload failed, keeping previous"),
        }
    }
}

/// Loads a manager's first document unless it already has one.
async fn load_document(
    manager: &ManifestManager,
    token: &CancellationToken,
) -> Result<Arc<ManifestDocument>, PlayerError> {
    if let Some(document) = manager.current_document() {
        return Ok(document);
    }
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => {
            manager.cancel_reload();
            return Err(PlayerError::Cancelled);
        }
        outcome = manager.reload_manifest() => outcome,
    };
    manager.current_document().ok_or(match outcome {
        ReloadOutcome::DownloadFailed(e) | ReloadOutcome::ParseFailed(e) => PlayerError::Manifest(e),
        _ => PlayerError::Cancelled,
    })
}

/// Feeders and drivers serving one playback position.
struct PipelineSet {
    token: CancellationToken,
    buffers: Vec<SharedBuffer>,
    drivers: Vec<Arc<DemuxDriver>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineSet {
    async fn shutdown(self) {
        self.token.cancel();
        for buffer in &self.buffers {
            buffer.close();
        }
        join_all(self.tasks, STOP_GRACE).await;
    }
}

struct Built {
    set: PipelineSet,
    streams: Vec<PreparedStreams>,
    segment: TimelineSegment,
    start_position: Duration,
}

#[derive(Default)]
struct ManifestState {
    tracks: Vec<Arc<Track>>,
    dynamic: bool,
    duration: Option<Duration>,
    pipelines: Option<PipelineSet>,
    renderer: Option<Arc<StreamRenderer>>,
    reloaders: Vec<JoinHandle<()>>,
}

/// Plays DASH and HLS documents.
pub struct ManifestDataProvider {
    kind: ClipKind,
    manager: Arc<ManifestManager>,
    manifest_fetcher: Arc<dyn ManifestFetcher>,
    segment_fetcher: Arc<dyn SegmentFetcher>,
    config: PlayerConfig,
    context: Arc<PlaybackContext>,
    token: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<PlayerError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<PlayerError>>>,
    state: Mutex<ManifestState>,
}

impl ManifestDataProvider {
    pub fn new(
        kind: ClipKind,
        url: Url,
        manifest_fetcher: Arc<dyn ManifestFetcher>,
        segment_fetcher: Arc<dyn SegmentFetcher>,
        config: PlayerConfig,
        context: Arc<PlaybackContext>,
    ) -> Self {
        let manager = Arc::new(ManifestManager::new(url, manifest_fetcher.clone(), context.clone()));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            kind,
            manager,
            manifest_fetcher,
            segment_fetcher,
            config,
            context,
            token: CancellationToken::new(),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            state: Mutex::new(ManifestState::default()),
        }
    }

    /// Provider fetching documents and segments over HTTP.
    pub fn http(kind: ClipKind, url: Url, config: PlayerConfig, context: Arc<PlaybackContext>) -> Self {
        let manifest_fetcher = Arc::new(HttpManifestFetcher::new(context.http.clone(), &config.manifest));
        let segment_fetcher = Arc::new(SegmentLoader::new(context.clone(), config.manifest.clone()));
        Self::new(kind, url, manifest_fetcher, segment_fetcher, config, context)
    }

    /// Prefers a feeder's failure over the read error it caused.
    fn explain(&self, e: PlayerError) -> PlayerError {
        self.fatal_rx
            .lock()
            .as_mut()
            .and_then(|rx| rx.try_recv().ok())
            .unwrap_or(e)
    }

    async fn track(
        &self,
        period: Option<usize>,
        set: &AdaptationSet,
        wanted: Vec<StreamType>,
        token: &CancellationToken,
    ) -> Result<Arc<Track>, PlayerError> {
        let representation = self
            .config
            .manifest
            .selection_policy
            .select(set)
            .ok_or(PlayerError::NoStreams)?;
        info!(
            set = set.id.as_deref().unwrap_or("-"),
            representation = %representation.id,
            bandwidth = representation.bandwidth,
            ?wanted,
            "Representation selected"
        );

        if let SegmentAddressing::PlaylistRef(url) = &representation.addressing {
            let manager = Arc::new(ManifestManager::new(
                url.clone(),
                self.manifest_fetcher.clone(),
                self.context.clone(),
            ));
            let document = load_document(&manager, token).await?;
            let (content_type, representation_id) = document
                .periods
                .last()
                .and_then(|p| p.adaptation_sets.first())
                .and_then(|s| s.representations.first().map(|r| (s.content_type, r.id.clone())))
                .ok_or(PlayerError::NoStreams)?;
            return Ok(Arc::new(Track {
                manager,
                period: None,
                content_type,
                representation_id,
                bandwidth: representation.bandwidth,
                wanted,
            }));
        }

        Ok(Arc::new(Track {
            manager: self.manager.clone(),
            period,
            content_type: set.content_type,
            representation_id: representation.id.clone(),
            bandwidth: representation.bandwidth,
            wanted,
        }))
    }

    /// Picks the played adaptation sets: video (or muxed) and audio.
    async fn plan_tracks(
        &self,
        document: &ManifestDocument,
        token: &CancellationToken,
    ) -> Result<Vec<Arc<Track>>, PlayerError> {
        let index = if document.dynamic {
            document.periods.len().checked_sub(1)
        } else {
            (!document.periods.is_empty()).then_some(0)
        }
        .ok_or(PlayerError::NoStreams)?;
        let period = &document.periods[index];
        let period_ref = (!document.dynamic).then_some(index);

        let of_type = |content_type: ContentType| {
            period
                .adaptation_sets
                .iter()
                .find(|s| s.content_type == content_type && !s.representations.is_empty())
        };
        let primary = of_type(ContentType::Video).or_else(|| of_type(ContentType::Unknown));
        let audio = of_type(ContentType::Audio);

        let mut tracks = Vec::new();
        if let Some(set) = primary {
            let mut wanted = vec![StreamType::Video];
            if audio.is_none() {
                wanted.push(StreamType::Audio);
            }
            tracks.push(self.track(period_ref, set, wanted, token).await?);
        }
        if let Some(set) = audio {
            tracks.push(self.track(period_ref, set, vec![StreamType::Audio], token).await?);
        }
        if tracks.is_empty() {
            return Err(PlayerError::NoStreams);
        }
        Ok(tracks)
    }

    /// Starts one feeder per track and opens its demuxer.
    async fn build(&self, tracks: &[Arc<Track>], start: StartAt, token: &CancellationToken) -> Result<Built, PlayerError> {
        let mut set = PipelineSet {
            token: self.token.child_token(),
            buffers: Vec::new(),
            drivers: Vec::new(),
            tasks: Vec::new(),
        };
        let mut streams = Vec::new();
        let mut timeline = None;

        for track in tracks {
            let result = self.build_track(track, start, &mut set, token).await;
            let (prepared, track_timeline) = match result {
                Ok(built) => built,
                Err(e) => {
                    set.shutdown().await;
                    return Err(e);
                }
            };
            timeline.get_or_insert(track_timeline);
            streams.push(prepared);
        }

        let (segment, start_position) = timeline.ok_or(PlayerError::NoStreams)?;
        Ok(Built {
            set,
            streams,
            segment,
            start_position,
        })
    }

    async fn build_track(
        &self,
        track: &Arc<Track>,
        start: StartAt,
        set: &mut PipelineSet,
        token: &CancellationToken,
    ) -> Result<(PreparedStreams, (TimelineSegment, Duration)), PlayerError> {
        let document = track.manager.current_document().ok_or(PlayerError::NoSource)?;
        let requests = track.requests(&document)?;
        let start = if document.dynamic { StartAt::LiveEdge } else { start };
        let cursor = FeedCursor::starting_at(&requests, start);
        let first = cursor.pending(&requests).into_iter().find(|r| !r.init);

        let buffer = if document.dynamic {
            SharedBuffer::with_retention(LIVE_RETENTION)
        } else {
            SharedBuffer::new()
        };
        let reader = buffer.reader();
        set.buffers.push(buffer.clone());
        let feeder = SegmentFeeder {
            track: track.clone(),
            fetcher: self.segment_fetcher.clone(),
            buffer,
            cursor,
        };
        set.tasks
            .push(tokio::spawn(feeder.run(self.fatal_tx.clone(), set.token.clone())));

        let config = DemuxerConfig {
            variant_bitrate: (track.bandwidth > 0).then_some(track.bandwidth),
            ..self.config.demuxer.clone()
        };
        let mut driver = DemuxDriver::new(
            Demuxer::with_config(config),
            DriverSettings::from_config(&self.config),
            self.context.clone(),
        );
        driver
            .open(DataSource::pull(reader), token)
            .await
            .map_err(|e| self.explain(e))?;
        let prepared = driver.select_streams(&track.wanted)?;
        let segment = track.timeline(&document, first.as_ref(), prepared.start_time)?;
        let position = first.map_or(segment.base, |r| r.start);
        set.drivers.push(Arc::new(driver));
        Ok((prepared, (segment, position)))
    }

    fn start_drivers(&self, set: &mut PipelineSet, renderer: &Arc<StreamRenderer>) {
        for driver in &set.drivers {
            let driver = driver.clone();
            let renderer = renderer.clone();
            let token = set.token.clone();
            // Manifest drivers are repositioned by rebuilding, never by command
            let (_commands, receiver) = mpsc::channel(1);
            set.tasks.push(spawn_supervised(
                "manifest-demux",
                async move { driver.run(renderer, receiver, token).await },
                self.fatal_tx.clone(),
                set.token.clone(),
            ));
        }
    }
}

#[async_trait]
impl DataProvider for ManifestDataProvider {
    fn kind(&self) -> ClipKind {
        self.kind
    }

    async fn prepare(&self, token: &CancellationToken) -> Result<PreparedClip, PlayerError> {
        let document = load_document(&self.manager, token).await?;
        info!(
            url = %document.url,
            format = ?document.format,
            dynamic = document.dynamic,
            periods = document.periods.len(),
            "Document loaded"
        );
        let tracks = self.plan_tracks(&document, token).await?;

        let mut reloaders = Vec::new();
        let mut managers: Vec<&Arc<ManifestManager>> = Vec::new();
        for track in &tracks {
            if !managers.iter().any(|m| Arc::ptr_eq(m, &track.manager)) {
                managers.push(&track.manager);
                reloaders.push(tokio::spawn(reload_loop(track.manager.clone(), self.token.clone())));
            }
        }
        self.state.lock().reloaders = reloaders;

        let built = self.build(&tracks, StartAt::Beginning, token).await?;

        let mut drm_init_data: Vec<DrmInitData> = built
            .streams
            .iter()
            .filter_map(|s| s.drm_init_data.clone())
            .collect();
        for protection in document.content_protections() {
            if let Some(pssh) = &protection.pssh {
                let init = DrmInitData::cenc(pssh.clone());
                if !drm_init_data.contains(&init) {
                    drm_init_data.push(init);
                }
            }
        }

        let dynamic = tracks.iter().any(|t| t.manager.current_document().is_some_and(|d| d.dynamic));
        let duration = document
            .media_presentation_duration
            .or_else(|| built.streams.iter().filter_map(|s| s.duration).max());
        let streams = built.streams.iter().flat_map(|s| s.configs.iter().cloned()).collect();
        {
            let mut state = self.state.lock();
            state.tracks = tracks;
            state.dynamic = dynamic;
            state.duration = duration;
            state.pipelines = Some(built.set);
        }

        Ok(PreparedClip {
            streams,
            drm_init_data,
            duration,
            seekable: !dynamic,
            segment: built.segment,
            start_position: built.start_position,
        })
    }

    async fn start(
        &self,
        renderer: Arc<StreamRenderer>,
        fatal: mpsc::UnboundedSender<PlayerError>,
    ) -> Result<(), PlayerError> {
        let mut receiver = self.fatal_rx.lock().take().ok_or(PlayerError::NoSource)?;
        let forward_token = self.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = forward_token.cancelled() => return,
                    error = receiver.recv() => match error {
                        Some(error) => {
                            let _ = fatal.send(error);
                        }
                        None => return,
                    },
                }
            }
        });

        let mut state = self.state.lock();
        let active: Vec<StreamType> = state
            .pipelines
            .iter()
            .flat_map(|set| set.drivers.iter())
            .flat_map(|d| d.stream_types().iter().copied())
            .collect();
        renderer.synchronizer().set_active_streams(&active);
        let mut pipelines = state.pipelines.take().ok_or(PlayerError::NoSource)?;
        self.start_drivers(&mut pipelines, &renderer);
        state.pipelines = Some(pipelines);
        state.renderer = Some(renderer);
        Ok(())
    }

    async fn seek(&self, position: Duration) -> Result<TimelineSegment, PlayerError> {
        let (tracks, old, renderer) = {
            let mut state = self.state.lock();
            if state.dynamic {
                return Err(PlayerError::UnsupportedClip("live documents are not seekable".to_string()));
            }
            (state.tracks.clone(), state.pipelines.take(), state.renderer.clone())
        };
        if let Some(old) = old {
            old.shutdown().await;
        }
        if let Some(renderer) = &renderer {
            renderer.flush();
        }

        let mut built = self.build(&tracks, StartAt::Position(position), &self.token).await?;
        info!(
            position_ms = position.as_millis() as u64,
            landed_ms = built.start_position.as_millis() as u64,
            "Pipelines rebuilt for seek"
        );
        if let Some(renderer) = &renderer {
            renderer.synchronizer().set_segment(built.segment);
            self.start_drivers(&mut built.set, renderer);
        }
        self.state.lock().pipelines = Some(built.set);
        Ok(built.segment)
    }

    async fn stop(&self) {
        self.token.cancel();
        self.manager.cancel_reload();
        let (pipelines, reloaders) = {
            let mut state = self.state.lock();
            state.renderer = None;
            (state.pipelines.take(), std::mem::take(&mut state.reloaders))
        };
        if let Some(pipelines) = pipelines {
            pipelines.shutdown().await;
        }
        join_all(reloaders, STOP_GRACE).await;
        debug!(url = %self.manager.url(), "Manifest provider stopped");
    }

    fn duration(&self) -> Option<Duration> {
        self.state.lock().duration
    }
}

impl std::fmt::Debug for ManifestDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestDataProvider")
            .field("kind", &self.kind)
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("http://cdn.test/").unwrap().join(path).unwrap()
    }

    fn media(number: u64, start_secs: u64) -> SegmentRequest {
        SegmentRequest {
            url: url(&format!("seg-{number}.m4s")),
            byte_range: None,
            number,
            start: Duration::from_secs(start_secs),
            duration: Duration::from_secs(2),
            init: false,
            key: None,
            discontinuity: false,
        }
    }

    fn init() -> SegmentRequest {
        SegmentRequest {
            url: url("init.mp4"),
            duration: Duration::ZERO,
            init: true,
            ..media(0, 0)
        }
    }

    fn listing() -> Vec<SegmentRequest> {
        vec![init(), media(1, 0), media(2, 2), media(3, 4), media(4, 6), media(5, 8)]
    }

    fn numbers(requests: &[SegmentRequest]) -> Vec<Option<u64>> {
        requests.iter().map(|r| (!r.init).then_some(r.number)).collect()
    }

    #[test]
    fn test_cursor_from_beginning_writes_init_once() {
        let mut cursor = FeedCursor::starting_at(&listing(), StartAt::Beginning);
        let pending = cursor.pending(&listing());
        assert_eq!(numbers(&pending), vec![None, Some(1), Some(2), Some(3), Some(4), Some(5)]);

        for request in &pending[..3] {
            cursor.advance(request);
        }
        assert_eq!(numbers(&cursor.pending(&listing())), vec![Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn test_cursor_start_positions() {
        let cursor = FeedCursor::starting_at(&listing(), StartAt::Position(Duration::from_secs(5)));
        assert_eq!(numbers(&cursor.pending(&listing())), vec![None, Some(3), Some(4), Some(5)]);

        let past_end = FeedCursor::starting_at(&listing(), StartAt::Position(Duration::from_secs(60)));
        assert_eq!(past_end.next_number, Some(5));

        let live = FeedCursor::starting_at(&listing(), StartAt::LiveEdge);
        assert_eq!(numbers(&live.pending(&listing())), vec![None, Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn test_cursor_follows_sliding_window() {
        let mut cursor = FeedCursor::starting_at(&listing(), StartAt::LiveEdge);
        for request in cursor.pending(&listing()) {
            cursor.advance(&request);
        }
        let reloaded = vec![init(), media(4, 6), media(5, 8), media(6, 10), media(7, 12)];
        assert_eq!(numbers(&cursor.pending(&reloaded)), vec![Some(6), Some(7)]);
    }
}
