//! Contract of the platform decoder and renderer that receives clear packets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use media_packet::{Packet, StreamConfig, StreamType};
use tracing::{debug, info, trace};

/// Answer of the sink to one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Success,
    /// The sink is full; the packet was not taken
    Backpressure,
    Failure,
}

/// Platform decoder and renderer.
///
/// Only `submit_packet` may wait; the control calls return promptly.
#[async_trait]
pub trait PlatformSink: Send + Sync {
    fn set_stream_config(&self, config: &StreamConfig) -> SubmitResult;

    async fn submit_packet(&self, packet: &Packet) -> SubmitResult;

    fn submit_eos(&self, stream_type: StreamType) -> SubmitResult;

    fn play(&self);

    fn pause(&self);

    /// Packets submitted from now on start at `position`.
    fn seek(&self, position: Duration);

    fn stop(&self);
}

/// Sink that accepts everything and logs it.
#[derive(Debug, Default)]
pub struct LoggingSink {
    packets: [AtomicU64; 3],
    bytes: AtomicU64,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self, stream_type: StreamType) -> u64 {
        self.packets[stream_type.index()].load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PlatformSink for LoggingSink {
    fn set_stream_config(&self, config: &StreamConfig) -> SubmitResult {
        info!(
            stream = %config.stream_type(),
            codec = ?config.codec(),
            mime = config.codec().mime_type(),
            extra_data = config.extra_data().len(),
            "Stream configured"
        );
        SubmitResult::Success
    }

    async fn submit_packet(&self, packet: &Packet) -> SubmitResult {
        let count = self.packets[packet.stream_type.index()].fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
        trace!(
            stream = %packet.stream_type,
            pts_ms = packet.pts.as_millis() as u64,
            len = packet.len(),
            key = packet.is_key_frame,
            "Packet rendered"
        );
        if count % 500 == 0 {
            debug!(stream = %packet.stream_type, count, "Packets rendered");
        }
        SubmitResult::Success
    }

    fn submit_eos(&self, stream_type: StreamType) -> SubmitResult {
        info!(
            stream = %stream_type,
            packets = self.packets(stream_type),
            "End of stream"
        );
        SubmitResult::Success
    }

    fn play(&self) {
        info!("Sink playing");
    }

    fn pause(&self) {
        info!("Sink paused");
    }

    fn seek(&self, position: Duration) {
        info!(position_ms = position.as_millis() as u64, "Sink seek");
    }

    fn stop(&self) {
        info!(bytes = self.bytes(), "Sink stopped");
    }
}
