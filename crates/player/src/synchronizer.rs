//! Merges the packets of every stream type into one timeline-ordered
//! sequence.
//!
//! Producers push packets from any number of demuxers without ever
//! blocking. The single consumer takes them back in non-decreasing playback
//! time: a packet is only released once every active stream that has not
//! ended has something queued, so an earlier packet that has not arrived yet
//! is never overtaken by a later one that has.
//!
//! Ordering uses the decode timestamp mapped through the current
//! [`TimelineSegment`]. Within one stream packets keep their arrival order;
//! a packet that would go backwards in time is dropped as late.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use media_packet::{MediaPacket, StreamType};
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{PlaybackClock, StarvationPolicy, SyncError, SynchronizerConfig};

/// Maps container timestamps of the current segment onto the playback
/// timeline: `base + (ts - start)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimelineSegment {
    /// Playback time at which the segment begins
    pub base: Duration,
    /// Container timestamp of the segment's first sample
    pub start: Duration,
}

impl TimelineSegment {
    pub fn new(base: Duration, start: Duration) -> Self {
        Self { base, start }
    }

    pub fn playback_time(&self, timestamp: Duration) -> Duration {
        self.base + timestamp.saturating_sub(self.start)
    }
}

#[derive(Debug)]
struct Entry {
    packet: MediaPacket,
    time: Duration,
}

#[derive(Debug, Default)]
struct StreamQueue {
    entries: VecDeque<Entry>,
    active: bool,
    ended: bool,
    /// Since when the queue has been empty
    empty_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct SyncState {
    queues: [StreamQueue; 3],
    segment: TimelineSegment,
    /// Playback time of the last released packet
    watermark: Option<Duration>,
    closed: bool,
}

impl SyncState {
    fn any_active(&self) -> bool {
        self.queues.iter().any(|q| q.active)
    }
}

enum Decision {
    Ready(Option<MediaPacket>),
    /// Try again when notified or at the deadline
    Wait(Option<Instant>),
}

pub struct PacketSynchronizer {
    state: Mutex<SyncState>,
    /// Wakes the consumer
    available: Notify,
    /// Wakes producers waiting for queue space
    space: Notify,
    config: SynchronizerConfig,
    clock: Option<Arc<PlaybackClock>>,
    context: Arc<PlaybackContext>,
}

impl PacketSynchronizer {
    pub fn new(config: SynchronizerConfig, context: Arc<PlaybackContext>) -> Self {
        Self {
            state: Mutex::new(SyncState::default()),
            available: Notify::new(),
            space: Notify::new(),
            config,
            clock: None,
            context,
        }
    }

    /// Attaches the clock that `max_lead` is measured against.
    pub fn with_clock(mut self, clock: Arc<PlaybackClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the streams the consumer waits for. Queued packets of streams
    /// that are no longer active are discarded.
    pub fn set_active_streams(&self, stream_types: &[StreamType]) {
        let now = Instant::now();
        let mut state = self.state.lock();
        for stream_type in StreamType::ALL {
            let queue = &mut state.queues[stream_type.index()];
            queue.active = stream_types.contains(&stream_type);
            if !queue.active {
                queue.entries.clear();
            }
            if queue.entries.is_empty() {
                queue.empty_since = Some(now);
            }
        }
        drop(state);
        debug!(streams = ?stream_types, "Active streams set");
        self.available.notify_waiters();
    }

    pub fn active_streams(&self) -> Vec<StreamType> {
        let state = self.state.lock();
        StreamType::ALL
            .into_iter()
            .filter(|t| state.queues[t.index()].active)
            .collect()
    }

    /// Timeline mapping applied to packets added from now on.
    pub fn set_segment(&self, segment: TimelineSegment) {
        debug!(base = ?segment.base, start = ?segment.start, "Timeline segment set");
        self.state.lock().segment = segment;
    }

    /// Queues a packet. Never blocks; late packets and packets of inactive
    /// streams are dropped.
    pub fn add(&self, packet: MediaPacket) {
        let stream_type = packet.stream_type();
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.any_active() && !state.queues[stream_type.index()].active {
            trace!(%stream_type, "Dropping packet of inactive stream");
            return;
        }

        let time = state.segment.playback_time(packet.dts());
        let queue_tail = state.queues[stream_type.index()].entries.back().map(|e| e.time);
        let floor = state.watermark.max(queue_tail);
        if let Some(floor) = floor
            && time < floor
        {
            drop(state);
            warn!(%stream_type, time_ms = time.as_millis() as u64, floor_ms = floor.as_millis() as u64, "Dropping late packet");
            self.context.update_stats(|s| s.packets_dropped_late += 1);
            return;
        }

        let queue = &mut state.queues[stream_type.index()];
        queue.entries.push_back(Entry { packet, time });
        queue.empty_since = None;
        drop(state);
        self.available.notify_waiters();
    }

    /// Marks the end of a stream; once drained it no longer holds others back.
    pub fn add_eos(&self, stream_type: StreamType) {
        self.state.lock().queues[stream_type.index()].ended = true;
        debug!(%stream_type, "End of stream queued");
        self.available.notify_waiters();
    }

    /// Next packet in timeline order.
    ///
    /// Returns `Ok(None)` once every active stream has ended and drained.
    /// Packets are only removed from their queue when returned, so a
    /// cancelled call leaves everything queued.
    pub async fn take(&self, token: &CancellationToken) -> Result<Option<MediaPacket>, SyncError> {
        loop {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(SyncError::Closed);
                }
                self.decide(&mut state, Instant::now())
            };
            let deadline = match decision {
                Decision::Ready(packet) => {
                    if packet.is_some() {
                        self.space.notify_waiters();
                    }
                    return Ok(packet);
                }
                Decision::Wait(deadline) => deadline,
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }

    fn decide(&self, state: &mut SyncState, now: Instant) -> Decision {
        let mut deadline = None;
        let mut blocked = false;
        for queue in state.queues.iter().filter(|q| q.active && !q.ended && q.entries.is_empty()) {
            match (self.config.starvation, queue.empty_since) {
                (StarvationPolicy::After(limit), Some(since)) => {
                    let expires = since + limit;
                    if expires > now {
                        blocked = true;
                        deadline = earliest(deadline, expires);
                    }
                }
                _ => blocked = true,
            }
        }
        if blocked {
            return Decision::Wait(deadline);
        }

        // Ties go to the stream earliest in `StreamType` order
        let candidate = state
            .queues
            .iter()
            .enumerate()
            .filter_map(|(index, q)| q.entries.front().map(|e| (e.time, index)))
            .min();
        let Some((time, index)) = candidate else {
            let any_active = state.any_active();
            let finished = any_active && state.queues.iter().filter(|q| q.active).all(|q| q.ended);
            return if finished {
                Decision::Ready(None)
            } else {
                Decision::Wait(None)
            };
        };

        if let (Some(clock), Some(lead)) = (&self.clock, self.config.max_lead) {
            let limit = clock.position() + lead;
            if time > limit {
                // A stopped clock only moves again after `wake`
                let deadline = clock.is_running().then(|| now + (time - limit));
                return Decision::Wait(deadline);
            }
        }

        let queue = &mut state.queues[index];
        let Some(entry) = queue.entries.pop_front() else {
            return Decision::Wait(None);
        };
        if queue.entries.is_empty() {
            queue.empty_since = Some(now);
        }
        state.watermark = Some(state.watermark.map_or(time, |w| w.max(time)));
        Decision::Ready(Some(entry.packet))
    }

    /// Discards everything queued and resets the ordering watermark and end
    /// of stream flags. Used on seek and stop.
    pub fn flush(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let discarded: usize = state.queues.iter().map(|q| q.entries.len()).sum();
        for queue in &mut state.queues {
            queue.entries.clear();
            queue.ended = false;
            queue.empty_since = Some(now);
        }
        state.watermark = None;
        drop(state);
        debug!(discarded, "Synchronizer flushed");
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Flushes and fails every current and future wait.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            for queue in &mut state.queues {
                queue.entries.clear();
            }
        }
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Re-evaluates waiting consumers, e.g. after the clock started.
    pub fn wake(&self) {
        self.available.notify_waiters();
    }

    pub fn queued(&self, stream_type: StreamType) -> usize {
        self.state.lock().queues[stream_type.index()].entries.len()
    }

    pub fn total_queued(&self) -> usize {
        self.state.lock().queues.iter().map(|q| q.entries.len()).sum()
    }

    pub fn watermark(&self) -> Option<Duration> {
        self.state.lock().watermark
    }

    /// Waits until fewer than `limit` packets of `stream_type` are queued.
    pub async fn wait_for_space(
        &self,
        stream_type: StreamType,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.closed {
                    return Err(SyncError::Closed);
                }
                if state.queues[stream_type.index()].entries.len() < limit {
                    return Ok(());
                }
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }
}

impl std::fmt::Debug for PacketSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSynchronizer")
            .field("config", &self.config)
            .field("queued", &self.total_queued())
            .finish()
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use media_packet::Packet;
    use playback_common::create_test_context;

    use super::*;

    fn packet(stream_type: StreamType, ms: u64) -> MediaPacket {
        let ts = Duration::from_millis(ms);
        Packet::new(stream_type, ts, ts, Bytes::new()).into()
    }

    fn synchronizer(config: SynchronizerConfig) -> Arc<PacketSynchronizer> {
        let sync = PacketSynchronizer::new(config, create_test_context());
        sync.set_active_streams(&[StreamType::Audio, StreamType::Video]);
        Arc::new(sync)
    }

    async fn drain(sync: &PacketSynchronizer) -> Vec<(StreamType, u64)> {
        let token = CancellationToken::new();
        let mut out = Vec::new();
        while let Some(p) = sync.take(&token).await.unwrap() {
            out.push((p.stream_type(), p.pts().as_millis() as u64));
        }
        out
    }

    #[tokio::test]
    async fn test_interleaved_streams_come_out_in_order() {
        let sync = synchronizer(SynchronizerConfig::default());
        for ms in [0, 33, 66, 100, 133] {
            sync.add(packet(StreamType::Video, ms));
        }
        for ms in [0, 21, 42, 64, 85, 106, 128] {
            sync.add(packet(StreamType::Audio, ms));
        }
        sync.add_eos(StreamType::Video);
        sync.add_eos(StreamType::Audio);

        let out = drain(&sync).await;
        assert_eq!(out.len(), 12);
        assert!(out.windows(2).all(|w| w[0].1 <= w[1].1));
        // Equal times prefer audio
        assert_eq!(out[0], (StreamType::Audio, 0));
        assert_eq!(out[1], (StreamType::Video, 0));
    }

    /// Adds `count` packets `step_ms` apart, sleeping a pseudo-random
    /// 0..30ms before each one.
    async fn produce(sync: Arc<PacketSynchronizer>, stream_type: StreamType, step_ms: u64, count: u64, seed: u64) {
        let mut state = seed;
        for i in 0..count {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            tokio::time::sleep(Duration::from_millis((state >> 33) % 30)).await;
            sync.add(packet(stream_type, i * step_ms));
        }
        sync.add_eos(stream_type);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_producers_come_out_in_order() {
        for seed in [1, 7, 42, 1234, 98765] {
            let sync = synchronizer(SynchronizerConfig::default());
            let video = tokio::spawn(produce(sync.clone(), StreamType::Video, 33, 40, seed));
            let audio = tokio::spawn(produce(sync.clone(), StreamType::Audio, 21, 60, seed ^ 0x5DEECE66D));

            let out = drain(&sync).await;
            video.await.unwrap();
            audio.await.unwrap();

            assert_eq!(out.len(), 100, "seed {seed}: nothing may be dropped as late");
            assert!(
                out.windows(2).all(|w| w[0].1 <= w[1].1),
                "seed {seed}: out of order: {out:?}"
            );
            for (stream_type, step) in [(StreamType::Video, 33), (StreamType::Audio, 21)] {
                let times: Vec<u64> = out.iter().filter(|p| p.0 == stream_type).map(|p| p.1).collect();
                let expected: Vec<u64> = (0..times.len() as u64).map(|i| i * step).collect();
                assert_eq!(times, expected, "seed {seed}: {stream_type} reordered");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_empty_active_stream() {
        let sync = synchronizer(SynchronizerConfig::default());
        let token = CancellationToken::new();
        sync.add(packet(StreamType::Video, 100));

        let early = tokio::time::timeout(Duration::from_secs(5), sync.take(&token)).await;
        assert!(early.is_err(), "video must not overtake the missing audio");

        sync.add(packet(StreamType::Audio, 50));
        let first = sync.take(&token).await.unwrap().unwrap();
        assert_eq!(first.stream_type(), StreamType::Audio);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_take_keeps_packets() {
        let sync = synchronizer(SynchronizerConfig::default());
        let token = CancellationToken::new();
        sync.add(packet(StreamType::Video, 10));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        assert_eq!(sync.take(&token).await.unwrap_err(), SyncError::Cancelled);
        assert_eq!(sync.queued(StreamType::Video), 1);

        sync.add(packet(StreamType::Audio, 20));
        sync.add_eos(StreamType::Audio);
        sync.add_eos(StreamType::Video);
        assert_eq!(
            drain(&sync).await,
            vec![(StreamType::Video, 10), (StreamType::Audio, 20)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_discards_queued_packets() {
        let sync = synchronizer(SynchronizerConfig::default());
        let token = CancellationToken::new();
        sync.add(packet(StreamType::Audio, 0));
        sync.add(packet(StreamType::Video, 0));
        assert!(sync.take(&token).await.unwrap().is_some());

        sync.add(packet(StreamType::Audio, 500));
        sync.add_eos(StreamType::Video);
        sync.flush();
        assert_eq!(sync.total_queued(), 0);
        assert_eq!(sync.watermark(), None);

        let after = tokio::time::timeout(Duration::from_secs(1), sync.take(&token)).await;
        assert!(after.is_err());

        // Watermark reset: earlier timestamps are accepted after a seek back
        sync.add(packet(StreamType::Audio, 0));
        sync.add(packet(StreamType::Video, 0));
        assert!(sync.take(&token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_late_packets_are_dropped() {
        let context = create_test_context();
        let sync = PacketSynchronizer::new(SynchronizerConfig::default(), context.clone());
        sync.set_active_streams(&[StreamType::Audio]);
        let token = CancellationToken::new();

        sync.add(packet(StreamType::Audio, 100));
        sync.take(&token).await.unwrap();
        sync.add(packet(StreamType::Audio, 50));
        sync.add(packet(StreamType::Audio, 150));
        sync.add(packet(StreamType::Audio, 120));
        assert_eq!(sync.queued(StreamType::Audio), 1);
        assert_eq!(context.stats_snapshot().packets_dropped_late, 2);

        // Inactive streams are ignored
        sync.add(packet(StreamType::Subtitle, 200));
        assert_eq!(sync.total_queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starvation_policy_releases_other_streams() {
        let sync = synchronizer(SynchronizerConfig {
            max_lead: None,
            starvation: StarvationPolicy::After(Duration::from_millis(200)),
        });
        let token = CancellationToken::new();
        sync.add(packet(StreamType::Video, 0));

        let start = Instant::now();
        let taken = sync.take(&token).await.unwrap().unwrap();
        assert_eq!(taken.stream_type(), StreamType::Video);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_lead_follows_clock() {
        let clock = Arc::new(PlaybackClock::new());
        let sync = PacketSynchronizer::new(
            SynchronizerConfig {
                max_lead: Some(Duration::from_secs(1)),
                starvation: StarvationPolicy::Wait,
            },
            create_test_context(),
        )
        .with_clock(clock.clone());
        sync.set_active_streams(&[StreamType::Audio]);
        let token = CancellationToken::new();

        sync.add(packet(StreamType::Audio, 0));
        sync.add(packet(StreamType::Audio, 3000));
        clock.start();
        sync.wake();

        let start = Instant::now();
        sync.take(&token).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        sync.take(&token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_segment_base_orders_across_segments() {
        let sync = synchronizer(SynchronizerConfig::default());
        sync.add(packet(StreamType::Audio, 5000));
        sync.set_segment(TimelineSegment::new(Duration::from_secs(10), Duration::ZERO));
        sync.add(packet(StreamType::Video, 1000));
        sync.add_eos(StreamType::Audio);
        sync.add_eos(StreamType::Video);
        assert_eq!(
            drain(&sync).await,
            vec![(StreamType::Audio, 5000), (StreamType::Video, 1000)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_space() {
        let sync = synchronizer(SynchronizerConfig::default());
        let token = CancellationToken::new();
        for ms in [0, 10, 20] {
            sync.add(packet(StreamType::Audio, ms));
        }
        sync.add(packet(StreamType::Video, 0));
        sync.wait_for_space(StreamType::Audio, 4, &token).await.unwrap();

        let producer = tokio::spawn({
            let sync = sync.clone();
            let token = token.clone();
            async move { sync.wait_for_space(StreamType::Audio, 3, &token).await }
        });
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        sync.take(&token).await.unwrap();
        producer.await.unwrap().unwrap();

        sync.close();
        assert_eq!(
            sync.wait_for_space(StreamType::Audio, 1, &token).await,
            Err(SyncError::Closed)
        );
    }
}
