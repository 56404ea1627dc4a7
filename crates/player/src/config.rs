use std::{fmt::Display, time::Duration};

use demux::DemuxerConfig;
use drm::DrmConfig;
use manifest::ManifestConfig;
use playback_common::HttpConfig;

/// What the synchronizer does while an active stream has nothing queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StarvationPolicy {
    /// Wait for the stream, however long it takes
    #[default]
    Wait,
    /// Stop waiting for a stream that stayed empty this long
    After(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct SynchronizerConfig {
    /// Furthest a released packet may be ahead of the playback clock
    pub max_lead: Option<Duration>,
    pub starvation: StarvationPolicy,
}

/// What the renderer does when the sink does not accept a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkRejectPolicy {
    /// Abort the pushing loop on any non-success result
    #[default]
    Fail,
    /// Retry backpressure results after `delay`, at most `max_attempts`
    /// times; failures still abort
    RetryBackpressure { delay: Duration, max_attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub sink_reject_policy: SinkRejectPolicy,

    /// Buffered-ahead duration below which playback counts as buffering
    pub buffering_low_watermark: Duration,

    /// Buffered-ahead duration at which buffering ends
    pub buffering_high_watermark: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            sink_reject_policy: SinkRejectPolicy::default(),
            buffering_low_watermark: Duration::from_millis(500),
            buffering_high_watermark: Duration::from_secs(2),
        }
    }
}

/// Player configuration
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub http: HttpConfig,
    pub manifest: ManifestConfig,
    pub demuxer: DemuxerConfig,
    pub drm: DrmConfig,
    pub synchronizer: SynchronizerConfig,
    pub renderer: RendererConfig,

    /// Queued packets per stream type before demuxing pauses
    pub max_queued_packets: usize,

    /// Packets read from a demuxer per blocking call
    pub demux_batch_size: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            manifest: ManifestConfig::default(),
            demuxer: DemuxerConfig::default(),
            drm: DrmConfig::default(),
            synchronizer: SynchronizerConfig::default(),
            renderer: RendererConfig::default(),
            max_queued_packets: 256,
            demux_batch_size: 16,
        }
    }
}

impl Display for PlayerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "PlayerConfig {{")?;
        writeln!(f, "  {},", self.manifest)?;
        writeln!(f, "  {},", self.demuxer)?;
        writeln!(f, "  {},", self.drm)?;
        writeln!(
            f,
            "  max_lead: {}, starvation: {:?},",
            self.synchronizer
                .max_lead
                .map_or_else(|| "unbounded".to_string(), |d| format!("{}ms", d.as_millis())),
            self.synchronizer.starvation
        )?;
        writeln!(
            f,
            "  sink_reject_policy: {:?}, buffering: {}ms..{}ms,",
            self.renderer.sink_reject_policy,
            self.renderer.buffering_low_watermark.as_millis(),
            self.renderer.buffering_high_watermark.as_millis()
        )?;
        writeln!(
            f,
            "  max_queued_packets: {}, demux_batch_size: {}",
            self.max_queued_packets, self.demux_batch_size
        )?;
        write!(f, "}}")
    }
}

impl PlayerConfig {
    pub fn builder() -> PlayerConfigBuilder {
        PlayerConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerConfigBuilder {
    config: PlayerConfig,
}

impl PlayerConfigBuilder {
    pub fn http(mut self, http: HttpConfig) -> Self {
        self.config.http = http;
        self
    }

    pub fn manifest(mut self, manifest: ManifestConfig) -> Self {
        self.config.manifest = manifest;
        self
    }

    pub fn demuxer(mut self, demuxer: DemuxerConfig) -> Self {
        self.config.demuxer = demuxer;
        self
    }

    pub fn drm(mut self, drm: DrmConfig) -> Self {
        self.config.drm = drm;
        self
    }

    pub fn max_lead(mut self, max_lead: Option<Duration>) -> Self {
        self.config.synchronizer.max_lead = max_lead;
        self
    }

    pub fn starvation(mut self, policy: StarvationPolicy) -> Self {
        self.config.synchronizer.starvation = policy;
        self
    }

    pub fn sink_reject_policy(mut self, policy: SinkRejectPolicy) -> Self {
        self.config.renderer.sink_reject_policy = policy;
        self
    }

    /// Watermarks are swapped if given in the wrong order.
    pub fn buffering_watermarks(mut self, low: Duration, high: Duration) -> Self {
        self.config.renderer.buffering_low_watermark = low.min(high);
        self.config.renderer.buffering_high_watermark = low.max(high);
        self
    }

    pub fn max_queued_packets(mut self, packets: usize) -> Self {
        self.config.max_queued_packets = packets.max(1);
        self
    }

    pub fn demux_batch_size(mut self, packets: usize) -> Self {
        self.config.demux_batch_size = packets.max(1);
        self
    }

    pub fn build(self) -> PlayerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_display() {
        let config = PlayerConfig::builder()
            .max_lead(Some(Duration::from_millis(1500)))
            .sink_reject_policy(SinkRejectPolicy::RetryBackpressure {
                delay: Duration::from_millis(10),
                max_attempts: 5,
            })
            .buffering_watermarks(Duration::from_secs(3), Duration::from_secs(1))
            .max_queued_packets(0)
            .build();

        assert_eq!(config.renderer.buffering_low_watermark, Duration::from_secs(1));
        assert_eq!(config.renderer.buffering_high_watermark, Duration::from_secs(3));
        assert_eq!(config.max_queued_packets, 1);
        assert_eq!(config.synchronizer.starvation, StarvationPolicy::Wait);

        let text = config.to_string();
        assert!(text.contains("max_lead: 1500ms"));
        assert!(text.contains("RetryBackpressure"));
    }
}
