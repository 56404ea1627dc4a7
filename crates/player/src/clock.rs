//! Playback position clock.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct ClockState {
    /// Position at the last start, pause or reset
    base: Duration,
    /// Set while running
    started_at: Option<Instant>,
}

/// Wall-clock driven playback position.
///
/// Runs on tokio's [`Instant`], so paused test time drives it as well.
#[derive(Debug)]
pub struct PlaybackClock {
    state: Mutex<ClockState>,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                base: Duration::ZERO,
                started_at: None,
            }),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.started_at.take() {
            state.base += started.elapsed();
        }
    }

    /// Moves the position, keeping the running state.
    pub fn reset(&self, position: Duration) {
        let mut state = self.state.lock();
        state.base = position;
        if state.started_at.is_some() {
            state.started_at = Some(Instant::now());
        }
    }

    pub fn position(&self) -> Duration {
        let state = self.state.lock();
        match state.started_at {
            Some(started) => state.base + started.elapsed(),
            None => state.base,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().started_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_runs_only_while_started() {
        let clock = PlaybackClock::new();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(clock.position(), Duration::ZERO);

        clock.start();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.position(), Duration::from_millis(1500));

        clock.pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.position(), Duration::from_millis(1500));
        assert!(!clock.is_running());

        clock.reset(Duration::from_secs(30));
        clock.start();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.position(), Duration::from_millis(30_250));
    }
}
