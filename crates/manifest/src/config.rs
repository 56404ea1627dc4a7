use std::{fmt::Display, time::Duration};

use crate::selection::RepresentationSelectionPolicy;

/// Manifest loading configuration
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// Timeout of a single manifest download
    pub request_timeout: Duration,

    /// Timeout of a single media segment download
    pub segment_timeout: Duration,

    /// Retries of a segment download after a network or server error
    pub segment_retries: u32,

    /// Base delay of the exponential segment retry backoff
    pub segment_retry_delay: Duration,

    /// Representation chosen from each adaptation set
    pub selection_policy: RepresentationSelectionPolicy,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            segment_timeout: Duration::from_secs(10),
            segment_retries: 3,
            segment_retry_delay: Duration::from_millis(500),
            selection_policy: RepresentationSelectionPolicy::default(),
        }
    }
}

impl Display for ManifestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ManifestConfig {{ request_timeout: {:.1}s, segment_timeout: {:.1}s, segment_retries: {}, selection: {:?} }}",
            self.request_timeout.as_secs_f64(),
            self.segment_timeout.as_secs_f64(),
            self.segment_retries,
            self.selection_policy
        )
    }
}

impl ManifestConfig {
    pub fn builder() -> ManifestConfigBuilder {
        ManifestConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestConfigBuilder {
    config: ManifestConfig,
}

impl ManifestConfigBuilder {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn segment_timeout(mut self, timeout: Duration) -> Self {
        self.config.segment_timeout = timeout;
        self
    }

    pub fn segment_retries(mut self, retries: u32, base_delay: Duration) -> Self {
        self.config.segment_retries = retries;
        self.config.segment_retry_delay = base_delay;
        self
    }

    pub fn selection_policy(mut self, policy: RepresentationSelectionPolicy) -> Self {
        self.config.selection_policy = policy;
        self
    }

    pub fn build(self) -> ManifestConfig {
        self.config
    }
}
