use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{ManifestConfig, ManifestError, Result};

/// Downloads manifest documents.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Fetches the body of `url` as text. Returns
    /// [`ManifestError::Cancelled`] once `token` is cancelled.
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<String>;
}

/// Fetcher issuing plain HTTP GET requests.
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpManifestFetcher {
    pub fn new(client: Client, config: &ManifestConfig) -> Self {
        Self {
            client,
            timeout: config.request_timeout,
        }
    }

    async fn get(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ManifestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        debug!(%url, len = body.len(), "Fetched manifest");
        Ok(body)
    }

    fn map_error(&self, err: reqwest::Error) -> ManifestError {
        if err.is_timeout() {
            ManifestError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ManifestError::Cancelled),
            result = self.get(url) => result,
        }
    }
}
