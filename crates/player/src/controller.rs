//! Player state machine and the wiring of one playback session.
//!
//! The controller owns the data provider, the renderer and the DRM session
//! manager of the current clip. External callers drive it through
//! `set_source`, `start`, `pause`, `stop` and `seek_to`; state changes and
//! failures are published on a `watch` and a `broadcast` channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use drm::{DrmDescription, DrmSessionManager, HttpLicenseTransport, LicenseTransport};
use media_packet::StreamConfig;
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    BufferingObserver, ClipDefinition, ClipKind, DataProvider, DataProviderFactory, PacketSynchronizer,
    PlatformSink, PlaybackClock, PlayerConfig, PlayerError, PreparedClip, PushOutcome, RendererError,
    StreamRenderer, SubmitResult, TimelineSegment,
};

/// Externally visible player state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Prepared,
    Playing,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl PlayerState {
    pub fn can_transition_to(self, next: PlayerState) -> bool {
        use PlayerState::*;
        matches!(
            (self, next),
            (_, Error)
                | (Idle | Prepared | Stopped | Completed | Error, Prepared)
                | (Prepared | Paused, Playing)
                | (Playing, Paused)
                | (Playing | Paused, Stopped)
                | (Playing, Completed)
        )
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlayerState::Idle => "idle",
            PlayerState::Prepared => "prepared",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Stopped => "stopped",
            PlayerState::Completed => "completed",
            PlayerState::Error => "error",
        })
    }
}

/// Notifications for observers of a [`PlayerController`].
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChanged { from: PlayerState, to: PlayerState },
    Error(PlayerError),
    BufferingChanged(bool),
    DurationChanged(Option<Duration>),
}

/// Description of the current clip.
#[derive(Debug, Clone)]
pub struct ClipInfo {
    pub url: String,
    pub kind: ClipKind,
    pub streams: Vec<StreamConfig>,
    pub duration: Option<Duration>,
    pub seekable: bool,
}

/// State visible without the controller lock.
struct Shared {
    state: watch::Sender<PlayerState>,
    events: broadcast::Sender<PlayerEvent>,
    clock: Arc<PlaybackClock>,
    duration: Mutex<Option<Duration>>,
    clip: Mutex<Option<ClipInfo>>,
}

impl Shared {
    fn emit(&self, event: PlayerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn check(&self, operation: &'static str, next: PlayerState) -> Result<(), PlayerError> {
        let state = *self.state.borrow();
        if state.can_transition_to(next) {
            Ok(())
        } else {
            Err(PlayerError::InvalidState { operation, state })
        }
    }

    fn transition(&self, operation: &'static str, next: PlayerState) -> Result<(), PlayerError> {
        let mut result = Ok(());
        let mut from = next;
        self.state.send_if_modified(|state| {
            if !state.can_transition_to(next) {
                result = Err(PlayerError::InvalidState {
                    operation,
                    state: *state,
                });
                return false;
            }
            from = std::mem::replace(state, next);
            from != next
        });
        result?;
        if from != next {
            info!(%from, to = %next, "Player state changed");
            self.emit(PlayerEvent::StateChanged { from, to: next });
        }
        Ok(())
    }

    /// Fatal error: the state becomes `Error` and nothing else is reported.
    fn fail(&self, error: PlayerError) {
        error!(error = %error, "Playback failed");
        self.clock.pause();
        let from = self.state.send_replace(PlayerState::Error);
        self.emit(PlayerEvent::Error(error));
        if from != PlayerState::Error {
            self.emit(PlayerEvent::StateChanged {
                from,
                to: PlayerState::Error,
            });
        }
    }

    fn complete(&self) {
        if self.transition("complete", PlayerState::Completed).is_ok() {
            self.clock.pause();
        }
    }

    fn set_duration(&self, duration: Option<Duration>) {
        let changed = {
            let mut current = self.duration.lock();
            std::mem::replace(&mut *current, duration) != duration
        };
        if changed {
            self.emit(PlayerEvent::DurationChanged(duration));
        }
    }
}

/// Everything built for the current clip.
struct Session {
    provider: Box<dyn DataProvider>,
    renderer: Arc<StreamRenderer>,
    drm: Arc<DrmSessionManager>,
    prepared: PreparedClip,
    segment: TimelineSegment,
    /// Cancelled on teardown and on fatal errors
    token: CancellationToken,
    fatal: mpsc::UnboundedSender<PlayerError>,
    started: bool,
    push: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Session {
    async fn stop_pushing(&mut self) {
        if let Some((token, task)) = self.push.take() {
            token.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "Push task ended abnormally");
            }
        }
    }

    fn start_pushing(&mut self, shared: &Arc<Shared>, sink: &Arc<dyn PlatformSink>) {
        let token = self.token.child_token();
        let task = tokio::spawn(push_task(
            shared.clone(),
            self.renderer.clone(),
            sink.clone(),
            self.segment,
            token.clone(),
        ));
        self.push = Some((token, task));
    }

    async fn teardown(mut self) {
        self.stop_pushing().await;
        self.token.cancel();
        self.provider.stop().await;
        self.renderer.synchronizer().close();
        self.drm.close();
    }
}

async fn push_task(
    shared: Arc<Shared>,
    renderer: Arc<StreamRenderer>,
    sink: Arc<dyn PlatformSink>,
    segment: TimelineSegment,
    token: CancellationToken,
) {
    match renderer.push_packets(segment, sink.as_ref(), &token).await {
        Ok(PushOutcome::Completed) => {
            info!("Playback completed");
            shared.complete();
        }
        Ok(PushOutcome::Cancelled) => debug!("Packet pushing stopped"),
        Err(RendererError::Sync(_)) if token.is_cancelled() => {}
        Err(e) => shared.fail(e.into()),
    }
}

struct Inner {
    factory: DataProviderFactory,
    config: PlayerConfig,
    context: Arc<PlaybackContext>,
    transport: Arc<dyn LicenseTransport>,
    sink: Arc<dyn PlatformSink>,
    session: Option<Session>,
}

/// Drives playback of one clip at a time into a [`PlatformSink`].
pub struct PlayerController {
    shared: Arc<Shared>,
    inner: tokio::sync::Mutex<Inner>,
}

impl PlayerController {
    pub fn new(config: PlayerConfig, sink: Arc<dyn PlatformSink>, context: Arc<PlaybackContext>) -> Self {
        let transport = Arc::new(HttpLicenseTransport::new(context.http.clone(), &config.drm));
        let (state, _) = watch::channel(PlayerState::Idle);
        let (events, _) = broadcast::channel(64);
        info!(name = %context.name, config = %config, "Player created");
        Self {
            shared: Arc::new(Shared {
                state,
                events,
                clock: Arc::new(PlaybackClock::new()),
                duration: Mutex::new(None),
                clip: Mutex::new(None),
            }),
            inner: tokio::sync::Mutex::new(Inner {
                factory: DataProviderFactory::new(config.clone(), context.clone()),
                config,
                context,
                transport,
                sink,
                session: None,
            }),
        }
    }

    /// Replaces the license transport used by sessions created afterwards.
    pub fn with_license_transport(mut self, transport: Arc<dyn LicenseTransport>) -> Self {
        self.inner.get_mut().transport = transport;
        self
    }

    pub fn state(&self) -> PlayerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn position(&self) -> Duration {
        self.shared.clock.position()
    }

    pub fn duration(&self) -> Option<Duration> {
        *self.shared.duration.lock()
    }

    pub fn clip_info(&self) -> Option<ClipInfo> {
        self.shared.clip.lock().clone()
    }

    /// Tears down the current clip and prepares `clip`.
    pub async fn set_source(&self, clip: ClipDefinition, token: &CancellationToken) -> Result<(), PlayerError> {
        let provider = self.inner.lock().await.factory.create(&clip)?;
        self.set_provider(&clip.url, provider, clip.drm, token).await
    }

    /// Like [`set_source`](Self::set_source) with a ready-made provider.
    pub async fn set_provider(
        &self,
        url: &str,
        provider: Box<dyn DataProvider>,
        drm_descriptions: Vec<DrmDescription>,
        token: &CancellationToken,
    ) -> Result<(), PlayerError> {
        let mut inner = self.inner.lock().await;
        self.shared.check("set source", PlayerState::Prepared).or_else(|e| {
            // A running clip is stopped first
            match self.state() {
                PlayerState::Playing | PlayerState::Paused => Ok(()),
                _ => Err(e),
            }
        })?;

        if let Some(session) = inner.session.take() {
            session.teardown().await;
            inner.sink.stop();
            if matches!(self.state(), PlayerState::Playing | PlayerState::Paused) {
                self.shared.transition("stop", PlayerState::Stopped)?;
            }
        }
        self.shared.clock.pause();

        let config = &inner.config;
        let synchronizer = Arc::new(
            PacketSynchronizer::new(config.synchronizer.clone(), inner.context.clone())
                .with_clock(self.shared.clock.clone()),
        );
        let observer = Arc::new(BufferingObserver::new(
            self.shared.clock.clone(),
            config.renderer.buffering_low_watermark,
            config.renderer.buffering_high_watermark,
        ));
        let drm = Arc::new(DrmSessionManager::new(
            config.drm.clone(),
            inner.transport.clone(),
            inner.context.clone(),
        ));
        for description in drm_descriptions {
            drm.add_description(description);
        }
        let renderer = Arc::new(StreamRenderer::new(
            synchronizer,
            drm.clone(),
            observer.clone(),
            config.renderer.clone(),
            inner.context.clone(),
        ));

        let prepared = match provider.prepare(token).await {
            Ok(prepared) => prepared,
            Err(e) => {
                provider.stop().await;
                drm.close();
                if !matches!(e, PlayerError::Cancelled) {
                    self.shared.fail(e.clone());
                }
                return Err(e);
            }
        };

        for config in &prepared.streams {
            let result = inner.sink.set_stream_config(config);
            if result != SubmitResult::Success {
                provider.stop().await;
                drm.close();
                let e = PlayerError::Renderer(RendererError::UnhandledSubmitResult {
                    result,
                    stream_type: config.stream_type(),
                    pts: Duration::ZERO,
                });
                self.shared.fail(e.clone());
                return Err(e);
            }
        }

        let session_token = CancellationToken::new();
        let (fatal, fatal_rx) = mpsc::unbounded_channel();
        spawn_fatal_listener(self.shared.clone(), fatal_rx, session_token.clone());
        spawn_buffering_forwarder(self.shared.clone(), observer.subscribe(), session_token.clone());
        for init_data in prepared.drm_init_data.clone() {
            let renderer = renderer.clone();
            let fatal = fatal.clone();
            let token = session_token.clone();
            // Licenses are acquired while the pipeline fills; decryption
            // waits for the keys
            tokio::spawn(async move {
                if let Err(e) = renderer.handle_drm_init_data(&init_data, &token).await
                    && !token.is_cancelled()
                {
                    let _ = fatal.send(e.into());
                }
            });
        }

        self.shared.clock.reset(prepared.start_position);
        self.shared.set_duration(prepared.duration);
        *self.shared.clip.lock() = Some(ClipInfo {
            url: url.to_string(),
            kind: provider.kind(),
            streams: prepared.streams.clone(),
            duration: prepared.duration,
            seekable: prepared.seekable,
        });
        info!(
            url,
            kind = %provider.kind(),
            streams = prepared.streams.len(),
            duration_ms = prepared.duration.map(|d| d.as_millis() as u64),
            protected = !prepared.drm_init_data.is_empty(),
            "Clip prepared"
        );

        inner.session = Some(Session {
            provider,
            renderer,
            drm,
            segment: prepared.segment,
            prepared,
            token: session_token,
            fatal,
            started: false,
            push: None,
        });
        self.shared.transition("set source", PlayerState::Prepared)
    }

    /// Starts or resumes playback.
    pub async fn start(&self) -> Result<(), PlayerError> {
        let mut inner = self.inner.lock().await;
        self.shared.check("start", PlayerState::Playing)?;
        let Inner { session, sink, .. } = &mut *inner;
        let session = session.as_mut().ok_or(PlayerError::NoSource)?;

        if !session.started {
            if let Err(e) = session
                .provider
                .start(session.renderer.clone(), session.fatal.clone())
                .await
            {
                self.shared.fail(e.clone());
                return Err(e);
            }
            session.started = true;
        }

        sink.play();
        self.shared.clock.start();
        session.start_pushing(&self.shared, sink);
        session.renderer.synchronizer().wake();
        self.shared.transition("start", PlayerState::Playing)
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        let mut inner = self.inner.lock().await;
        self.shared.check("pause", PlayerState::Paused)?;
        let Inner { session, sink, .. } = &mut *inner;
        let session = session.as_mut().ok_or(PlayerError::NoSource)?;

        session.stop_pushing().await;
        sink.pause();
        self.shared.clock.pause();
        self.shared.transition("pause", PlayerState::Paused)
    }

    /// Stops playback and releases the clip's pipeline.
    pub async fn stop(&self) -> Result<(), PlayerError> {
        let mut inner = self.inner.lock().await;
        self.shared.check("stop", PlayerState::Stopped)?;
        let session = inner.session.take().ok_or(PlayerError::NoSource)?;

        session.teardown().await;
        inner.sink.stop();
        self.shared.clock.pause();
        self.shared.transition("stop", PlayerState::Stopped)
    }

    /// Moves playback to `position`, clamped to the clip duration. Returns
    /// the position used.
    ///
    /// A provider that fails to reposition leaves nothing to play: the
    /// session is torn down and the player enters `Error`.
    pub async fn seek_to(&self, position: Duration) -> Result<Duration, PlayerError> {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if !matches!(state, PlayerState::Playing | PlayerState::Paused) {
            return Err(PlayerError::InvalidState {
                operation: "seek",
                state,
            });
        }
        let Inner { session, sink, .. } = &mut *inner;
        let session = session.as_mut().ok_or(PlayerError::NoSource)?;
        if !session.prepared.seekable {
            return Err(PlayerError::UnsupportedClip(format!(
                "{} clips are not seekable",
                session.provider.kind()
            )));
        }

        let position = match self.duration() {
            Some(duration) => position.min(duration),
            None => position,
        };
        info!(position_ms = position.as_millis() as u64, "Seeking");

        session.stop_pushing().await;
        let segment = match session.provider.seek(position).await {
            Ok(segment) => segment,
            Err(e) => {
                if !matches!(e, PlayerError::Cancelled) {
                    if let Some(session) = inner.session.take() {
                        session.teardown().await;
                    }
                    inner.sink.stop();
                    self.shared.fail(e.clone());
                }
                return Err(e);
            }
        };
        session.segment = segment;
        sink.seek(position);
        self.shared.clock.reset(position);
        if state == PlayerState::Playing {
            session.start_pushing(&self.shared, sink);
        }
        Ok(position)
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        if let Some(session) = self.inner.get_mut().session.take() {
            session.token.cancel();
            // Providers stop asynchronously
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(session.teardown());
            }
        }
    }
}

impl fmt::Debug for PlayerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerController")
            .field("state", &self.state())
            .field("position", &self.position())
            .finish()
    }
}

/// Turns fatal errors of background work into the `Error` state and stops
/// the session's render loop.
fn spawn_fatal_listener(
    shared: Arc<Shared>,
    mut errors: mpsc::UnboundedReceiver<PlayerError>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            error = errors.recv() => {
                if let Some(error) = error {
                    token.cancel();
                    shared.fail(error);
                }
            }
        }
    });
}

fn spawn_buffering_forwarder(shared: Arc<Shared>, mut buffering: watch::Receiver<bool>, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                changed = buffering.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let value = *buffering.borrow_and_update();
                    debug!(buffering = value, "Buffering changed");
                    shared.emit(PlayerEvent::BufferingChanged(value));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use media_packet::{DrmInitData, KeyId, PsshBox, SystemId};
    use playback_common::create_test_context;

    use super::*;
    use crate::LoggingSink;

    /// Prepares an empty ten second clip whose repositioning always fails.
    #[derive(Default)]
    struct StubProvider {
        drm_init_data: Vec<DrmInitData>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DataProvider for StubProvider {
        fn kind(&self) -> ClipKind {
            ClipKind::Dash
        }

        async fn prepare(&self, _token: &CancellationToken) -> Result<PreparedClip, PlayerError> {
            Ok(PreparedClip {
                streams: Vec::new(),
                drm_init_data: self.drm_init_data.clone(),
                duration: Some(Duration::from_secs(10)),
                seekable: true,
                segment: TimelineSegment::default(),
                start_position: Duration::ZERO,
            })
        }

        async fn start(
            &self,
            _renderer: Arc<StreamRenderer>,
            _fatal: mpsc::UnboundedSender<PlayerError>,
        ) -> Result<(), PlayerError> {
            Ok(())
        }

        async fn seek(&self, _position: Duration) -> Result<TimelineSegment, PlayerError> {
            Err(PlayerError::Task("segment index unavailable".to_string()))
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn duration(&self) -> Option<Duration> {
            Some(Duration::from_secs(10))
        }
    }

    #[test]
    fn test_state_transitions() {
        use PlayerState::*;
        assert!(Idle.can_transition_to(Prepared));
        assert!(Prepared.can_transition_to(Playing));
        assert!(Playing.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Playing));
        assert!(Paused.can_transition_to(Stopped));
        assert!(Playing.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Prepared));
        for state in [Idle, Prepared, Playing, Paused, Stopped, Completed, Error] {
            assert!(state.can_transition_to(Error));
        }

        assert!(!Idle.can_transition_to(Playing));
        assert!(!Prepared.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Stopped.can_transition_to(Playing));
        assert!(!Completed.can_transition_to(Playing));
        assert!(!Prepared.can_transition_to(Stopped));
    }

    #[tokio::test]
    async fn test_failed_seek_enters_error_state() {
        let controller = PlayerController::new(
            PlayerConfig::default(),
            Arc::new(LoggingSink::new()),
            create_test_context(),
        );
        let provider = StubProvider::default();
        let stopped = provider.stopped.clone();
        let token = CancellationToken::new();

        controller
            .set_provider("https://cdn.test/clip.mpd", Box::new(provider), Vec::new(), &token)
            .await
            .unwrap();
        controller.start().await.unwrap();
        let mut events = controller.subscribe_events();

        let result = controller.seek_to(Duration::from_secs(3)).await;
        assert!(matches!(result, Err(PlayerError::Task(_))));
        assert_eq!(controller.state(), PlayerState::Error);
        assert!(stopped.load(Ordering::SeqCst));
        let events: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| !matches!(e, PlayerEvent::BufferingChanged(_)))
            .collect();
        assert!(matches!(
            events.as_slice(),
            [
                PlayerEvent::Error(PlayerError::Task(_)),
                PlayerEvent::StateChanged {
                    from: PlayerState::Playing,
                    to: PlayerState::Error
                }
            ]
        ));

        // Nothing is left to resume
        assert!(controller.start().await.is_err());
        assert!(controller.seek_to(Duration::from_secs(1)).await.is_err());
        assert_eq!(controller.state(), PlayerState::Error);
    }

    #[tokio::test]
    async fn test_protected_clip_without_drm_settings_fails() {
        let controller = PlayerController::new(
            PlayerConfig::default(),
            Arc::new(LoggingSink::new()),
            create_test_context(),
        );
        let pssh = PsshBox::new(SystemId::COMMON, vec![KeyId([0x11; 16])], Bytes::new()).to_bytes();
        let provider = StubProvider {
            drm_init_data: vec![DrmInitData::cenc(pssh)],
            ..StubProvider::default()
        };
        let mut events = controller.subscribe_events();

        let token = CancellationToken::new();
        controller
            .set_provider("https://cdn.test/protected.mpd", Box::new(provider), Vec::new(), &token)
            .await
            .unwrap();
        let mut states = controller.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == PlayerState::Error))
            .await
            .unwrap()
            .unwrap();

        let error = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
            PlayerEvent::Error(error) => Some(error),
            _ => None,
        });
        assert!(matches!(
            error,
            Some(PlayerError::Renderer(RendererError::Drm(drm::DrmError::InvalidArgument(_))))
        ));
    }
}
