use std::{fmt::Display, time::Duration};

/// DRM configuration
#[derive(Debug, Clone)]
pub struct DrmConfig {
    /// Timeout of a single license request
    pub license_timeout: Duration,

    /// Run AES work on the blocking thread pool instead of the caller's task
    pub offload_decryption: bool,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            license_timeout: Duration::from_secs(10),
            offload_decryption: false,
        }
    }
}

impl Display for DrmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DrmConfig {{ license_timeout: {:.1}s, offload_decryption: {} }}",
            self.license_timeout.as_secs_f64(),
            self.offload_decryption
        )
    }
}

impl DrmConfig {
    pub fn builder() -> DrmConfigBuilder {
        DrmConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DrmConfigBuilder {
    config: DrmConfig,
}

impl DrmConfigBuilder {
    pub fn license_timeout(mut self, timeout: Duration) -> Self {
        self.config.license_timeout = timeout;
        self
    }

    pub fn offload_decryption(mut self, offload: bool) -> Self {
        self.config.offload_decryption = offload;
        self
    }

    pub fn build(self) -> DrmConfig {
        self.config
    }
}
