//! Moves packets from the synchronizer through decryption into the sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use drm::{DrmError, DrmSessionManager};
use media_packet::{DrmInitData, MediaPacket, Packet};
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BufferingObserver, PacketSynchronizer, PlatformSink, RendererConfig, RendererError, SinkRejectPolicy,
    SubmitResult, SyncError, TimelineSegment,
};

/// How [`StreamRenderer::push_packets`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Every active stream ended and its end was forwarded to the sink
    Completed,
    Cancelled,
}

pub struct StreamRenderer {
    synchronizer: Arc<PacketSynchronizer>,
    drm: Arc<DrmSessionManager>,
    observer: Arc<BufferingObserver>,
    config: RendererConfig,
    context: Arc<PlaybackContext>,
    pushing: AtomicBool,
    /// Taken from the synchronizer but not yet accepted by the sink when
    /// the last loop was cancelled; submitted first by the next one
    held: Mutex<Option<MediaPacket>>,
}

/// Clears the pushing flag however the loop exits.
struct PushGuard<'a>(&'a AtomicBool);

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StreamRenderer {
    pub fn new(
        synchronizer: Arc<PacketSynchronizer>,
        drm: Arc<DrmSessionManager>,
        observer: Arc<BufferingObserver>,
        config: RendererConfig,
        context: Arc<PlaybackContext>,
    ) -> Self {
        Self {
            synchronizer,
            drm,
            observer,
            config,
            context,
            pushing: AtomicBool::new(false),
            held: Mutex::new(None),
        }
    }

    pub fn synchronizer(&self) -> &Arc<PacketSynchronizer> {
        &self.synchronizer
    }

    pub fn observer(&self) -> &Arc<BufferingObserver> {
        &self.observer
    }

    /// Queues a demuxed packet.
    pub fn handle_packet(&self, packet: MediaPacket) {
        self.synchronizer.add(packet);
    }

    /// Opens or updates the DRM sessions the init data calls for.
    pub async fn handle_drm_init_data(
        &self,
        init_data: &DrmInitData,
        token: &CancellationToken,
    ) -> Result<(), RendererError> {
        self.drm.handle_init_data(init_data, token).await?;
        Ok(())
    }

    pub fn is_pushing_packets(&self) -> bool {
        self.pushing.load(Ordering::Acquire)
    }

    /// Pushes packets until every stream ended or `token` is cancelled.
    ///
    /// Each iteration takes the next packet in timeline order, decrypts it
    /// if needed, submits it and yields. Only one loop may run at a time.
    /// A packet in flight when `token` is cancelled is kept and pushed
    /// first on the next call, unless [`flush`](Self::flush) runs in
    /// between.
    pub async fn push_packets(
        &self,
        segment: TimelineSegment,
        sink: &dyn PlatformSink,
        token: &CancellationToken,
    ) -> Result<PushOutcome, RendererError> {
        if self
            .pushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RendererError::AlreadyPushing);
        }
        let _guard = PushGuard(&self.pushing);
        debug!(base = ?segment.base, "Pushing packets");

        loop {
            let held = self.held.lock().take();
            let next = match held {
                Some(packet) => Ok(Some(packet)),
                None => self.synchronizer.take(token).await,
            };
            let packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    for stream_type in self.synchronizer.active_streams() {
                        let result = sink.submit_eos(stream_type);
                        if result != SubmitResult::Success {
                            warn!(%stream_type, ?result, "Sink did not accept end of stream");
                        }
                    }
                    info!("All streams rendered");
                    return Ok(PushOutcome::Completed);
                }
                Err(SyncError::Cancelled) => return Ok(PushOutcome::Cancelled),
                Err(e) => return Err(e.into()),
            };

            let packet = match packet {
                MediaPacket::Clear(packet) => packet,
                MediaPacket::Encrypted(encrypted) => {
                    match self.drm.decrypt_packet(encrypted.clone(), token).await {
                        Ok(packet) => packet,
                        Err(DrmError::Cancelled) => {
                            self.hold(MediaPacket::Encrypted(encrypted));
                            return Ok(PushOutcome::Cancelled);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            if !self.submit(sink, &packet, token).await? {
                self.hold(MediaPacket::Clear(packet));
                return Ok(PushOutcome::Cancelled);
            }
            self.observer
                .update(packet.stream_type, segment.playback_time(packet.pts + packet.duration));
            self.context.update_stats(|s| s.packets_rendered += 1);

            tokio::task::yield_now().await;
        }
    }

    fn hold(&self, packet: MediaPacket) {
        debug!(stream = %packet.stream_type(), pts = ?packet.pts(), "Holding packet for the next push");
        *self.held.lock() = Some(packet);
    }

    /// Submits one packet under the reject policy. `Ok(false)` when
    /// cancelled while backing off.
    async fn submit(
        &self,
        sink: &dyn PlatformSink,
        packet: &Packet,
        token: &CancellationToken,
    ) -> Result<bool, RendererError> {
        let mut attempts = 0;
        loop {
            let result = sink.submit_packet(packet).await;
            if result == SubmitResult::Success {
                return Ok(true);
            }
            if let (SubmitResult::Backpressure, SinkRejectPolicy::RetryBackpressure { delay, max_attempts }) =
                (result, self.config.sink_reject_policy)
                && attempts < max_attempts
            {
                attempts += 1;
                debug!(stream = %packet.stream_type, attempts, "Sink backpressure, retrying");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(false),
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            warn!(stream = %packet.stream_type, ?result, attempts, "Sink rejected packet");
            return Err(RendererError::UnhandledSubmitResult {
                result,
                stream_type: packet.stream_type,
                pts: packet.pts,
            });
        }
    }

    /// Discards queued packets, e.g. across a seek.
    pub fn flush(&self) {
        self.held.lock().take();
        self.synchronizer.flush();
        self.observer.reset();
    }
}

impl std::fmt::Debug for StreamRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRenderer")
            .field("config", &self.config)
            .field("pushing", &self.is_pushing_packets())
            .finish()
    }
}
