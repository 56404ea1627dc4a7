use std::time::Duration;

use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tracing::debug;

use crate::CommonError;

const DEFAULT_USER_AGENT: &str = concat!("cadence/", env!("CARGO_PKG_VERSION"));

/// Options for the shared HTTP client
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a request (zero = none)
    pub timeout: Duration,

    /// Time allowed to establish a connection (zero = none)
    pub connect_timeout: Duration,

    /// Idle connections are dropped after this long (zero = never)
    pub pool_idle_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Whether system proxy settings are honored
    pub use_system_proxy: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            use_system_proxy: true,
        }
    }
}

impl HttpConfig {
    pub fn builder() -> HttpConfigBuilder {
        HttpConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Adds a default header. Invalid names or values are rejected.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, CommonError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CommonError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| CommonError::InvalidHeader(format!("{name}: {e}")))?;
        self.config.headers.insert(name, value);
        Ok(self)
    }

    pub fn use_system_proxy(mut self, enabled: bool) -> Self {
        self.config.use_system_proxy = enabled;
        self
    }

    pub fn build(self) -> HttpConfig {
        self.config
    }
}

/// Builds the HTTP client shared by a playback session.
pub fn create_client(config: &HttpConfig) -> Result<Client, CommonError> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(4)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }
    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }
    if !config.pool_idle_timeout.is_zero() {
        builder = builder.pool_idle_timeout(config.pool_idle_timeout);
    }
    if !config.use_system_proxy {
        builder = builder.no_proxy();
        debug!("System proxy disabled for playback requests");
    }

    builder.build().map_err(CommonError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_headers() {
        let config = HttpConfig::builder()
            .header("X-Test", "1")
            .unwrap()
            .timeout(Duration::from_secs(5))
            .build();
        assert_eq!(config.headers.get("x-test").unwrap(), "1");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(create_client(&config).is_ok());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = HttpConfig::builder().header("bad header", "x");
        assert!(matches!(result, Err(CommonError::InvalidHeader(_))));
    }
}
