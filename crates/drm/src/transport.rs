use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{DrmConfig, DrmError, LicenseRequest, Result};

/// Delivers license requests to a license server.
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    async fn acquire_license(
        &self,
        license_url: &Url,
        request: &LicenseRequest,
        headers: &HashMap<String, String>,
        token: &CancellationToken,
    ) -> Result<Bytes>;
}

/// HTTP POST license transport.
#[derive(Debug, Clone)]
pub struct HttpLicenseTransport {
    client: Client,
    timeout: Duration,
}

impl HttpLicenseTransport {
    pub fn new(client: Client, config: &DrmConfig) -> Self {
        Self {
            client,
            timeout: config.license_timeout,
        }
    }

    async fn post(
        &self,
        license_url: &Url,
        request: &LicenseRequest,
        headers: &HashMap<String, String>,
    ) -> Result<Bytes> {
        let mut builder = self
            .client
            .post(license_url.clone())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, request.content_type)
            .body(request.body.clone());
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!(url = %license_url, len = request.body.len(), "Requesting license");
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %license_url, status = status.as_u16(), "License request rejected");
            return Err(DrmError::LicenseRejected {
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl LicenseTransport for HttpLicenseTransport {
    async fn acquire_license(
        &self,
        license_url: &Url,
        request: &LicenseRequest,
        headers: &HashMap<String, String>,
        token: &CancellationToken,
    ) -> Result<Bytes> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DrmError::Cancelled),
            result = self.post(license_url, request, headers) => result,
        }
    }
}
