use std::{fmt::Display, time::Duration};

/// Probe limits handed to the container engine
#[derive(Debug, Clone)]
pub struct DemuxerConfig {
    /// Maximum number of bytes read while looking for stream information
    pub probe_size: usize,

    /// Maximum span of media time analyzed while looking for stream information
    pub max_analyze_duration: Duration,

    /// Size of each read from the source
    pub read_chunk_size: usize,

    /// Bandwidth of the variant this input belongs to, attached to every
    /// stream as the `variant_bitrate` tag
    pub variant_bitrate: Option<u64>,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            probe_size: 128 * 1024,
            max_analyze_duration: Duration::from_secs(10),
            read_chunk_size: 16 * 1024,
            variant_bitrate: None,
        }
    }
}

impl Display for DemuxerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DemuxerConfig {{ probe_size: {} bytes, max_analyze_duration: {:.2}s, read_chunk_size: {} }}",
            self.probe_size,
            self.max_analyze_duration.as_secs_f64(),
            self.read_chunk_size
        )
    }
}

impl DemuxerConfig {
    pub fn builder() -> DemuxerConfigBuilder {
        DemuxerConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DemuxerConfigBuilder {
    config: DemuxerConfig,
}

impl DemuxerConfigBuilder {
    pub fn probe_size(mut self, probe_size: usize) -> Self {
        self.config.probe_size = probe_size;
        self
    }

    pub fn max_analyze_duration(mut self, duration: Duration) -> Self {
        self.config.max_analyze_duration = duration;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size.max(188);
        self
    }

    pub fn variant_bitrate(mut self, bitrate: u64) -> Self {
        self.config.variant_bitrate = Some(bitrate);
        self
    }

    pub fn build(self) -> DemuxerConfig {
        self.config
    }
}
