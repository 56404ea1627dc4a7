use std::sync::Arc;
use std::time::Duration;

use media_packet::StreamType;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::PlaybackClock;

/// Tracks how far ahead of the clock each stream has been submitted and
/// publishes whether playback is starved.
///
/// Buffering starts when the least buffered stream drops below the low
/// watermark and ends once it reaches the high watermark.
#[derive(Debug)]
pub struct BufferingObserver {
    clock: Arc<PlaybackClock>,
    low: Duration,
    high: Duration,
    /// End time of the last submitted packet per stream type
    submitted: Mutex<[Option<Duration>; 3]>,
    buffering: watch::Sender<bool>,
}

impl BufferingObserver {
    pub fn new(clock: Arc<PlaybackClock>, low: Duration, high: Duration) -> Self {
        let (buffering, _) = watch::channel(true);
        Self {
            clock,
            low,
            high,
            submitted: Mutex::new([None; 3]),
            buffering,
        }
    }

    /// Records a submitted packet ending at `end` on the playback timeline.
    pub fn update(&self, stream_type: StreamType, end: Duration) {
        {
            let mut submitted = self.submitted.lock();
            let slot = &mut submitted[stream_type.index()];
            *slot = Some(slot.map_or(end, |last| last.max(end)));
        }
        self.evaluate();
    }

    /// Buffered duration ahead of the clock of the least buffered stream.
    pub fn buffered_ahead(&self) -> Option<Duration> {
        let position = self.clock.position();
        self.submitted
            .lock()
            .iter()
            .flatten()
            .map(|end| end.saturating_sub(position))
            .min()
    }

    /// Re-evaluates the buffering state against the current clock.
    pub fn evaluate(&self) {
        let ahead = self.buffered_ahead().unwrap_or(Duration::ZERO);
        self.buffering.send_if_modified(|buffering| {
            let next = if *buffering { ahead < self.high } else { ahead < self.low };
            if next != *buffering {
                debug!(buffering = next, ahead_ms = ahead.as_millis() as u64, "Buffering state changed");
                *buffering = next;
                true
            } else {
                false
            }
        });
    }

    pub fn is_buffering(&self) -> bool {
        *self.buffering.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.buffering.subscribe()
    }

    /// Forgets submitted positions; playback buffers again from scratch.
    pub fn reset(&self) {
        *self.submitted.lock() = [None; 3];
        self.buffering.send_if_modified(|buffering| !std::mem::replace(buffering, true));
    }
}
