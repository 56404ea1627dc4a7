//! Media segment downloads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use playback_common::PlaybackContext;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::decryption::{decrypt_segment, sequence_iv};
use crate::{ByteRange, ManifestConfig, ManifestError, Result, SegmentKey, SegmentRequest};

/// Downloads the bytes of a [`SegmentRequest`].
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Fetches and, where the playlist says so, decrypts one segment.
    async fn fetch_segment(&self, request: &SegmentRequest, token: &CancellationToken) -> Result<Bytes>;
}

/// HTTP segment loader with retries and HLS AES-128 support.
pub struct SegmentLoader {
    client: Client,
    config: ManifestConfig,
    context: Arc<PlaybackContext>,
    keys: Mutex<HashMap<Url, Bytes>>,
}

impl SegmentLoader {
    pub fn new(context: Arc<PlaybackContext>, config: ManifestConfig) -> Self {
        Self {
            client: context.http.clone(),
            config,
            context,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// GET with retries on network and server errors (5xx), exponential
    /// backoff between attempts. Client errors (4xx) are not retried.
    async fn fetch_with_retries(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut request = self.client.get(url.clone()).timeout(self.config.segment_timeout);
            if let Some(range) = range {
                request = request.header(reqwest::header::RANGE, range.header_value());
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.bytes().await.map_err(ManifestError::from);
                }
                Ok(response) => {
                    let error = ManifestError::HttpStatus {
                        url: url.to_string(),
                        status: response.status().as_u16(),
                    };
                    if response.status().is_client_error() {
                        return Err(error);
                    }
                    error
                }
                Err(e) if e.is_timeout() => ManifestError::Timeout(self.config.segment_timeout),
                Err(e) if e.is_connect() || e.is_request() => e.into(),
                Err(e) => return Err(e.into()),
            };

            if attempts > self.config.segment_retries {
                warn!(%url, attempts, error = %failure, "Giving up on download");
                return Err(failure);
            }
            let delay = self.config.segment_retry_delay * 2_u32.pow(attempts.saturating_sub(1));
            debug!(%url, attempts, ?delay, error = %failure, "Retrying download");
            tokio::time::sleep(delay).await;
        }
    }

    async fn key(&self, uri: &Url) -> Result<Bytes> {
        let cached = self.keys.lock().get(uri).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }
        let key = self.fetch_with_retries(uri, None).await?;
        if key.len() != 16 {
            return Err(ManifestError::Decryption(format!(
                "key from {uri} has {} bytes, expected 16",
                key.len()
            )));
        }
        debug!(%uri, "Fetched segment key");
        self.keys.lock().insert(uri.clone(), key.clone());
        Ok(key)
    }

    async fn load(&self, request: &SegmentRequest) -> Result<Bytes> {
        let data = self.fetch_with_retries(&request.url, request.byte_range).await?;
        let data = match &request.key {
            None => data,
            Some(SegmentKey::Aes128 { uri, iv }) => {
                let key = self.key(uri).await?;
                let iv = iv.unwrap_or_else(|| sequence_iv(request.number));
                decrypt_segment(&data, &key, &iv)?
            }
            Some(SegmentKey::SampleAes { .. }) => {
                return Err(ManifestError::Decryption(
                    "SAMPLE-AES segments are not supported".to_string(),
                ));
            }
        };

        self.context.update_stats(|s| {
            s.segments_downloaded += 1;
            s.bytes_downloaded += data.len() as u64;
        });
        debug!(
            url = %request.url,
            number = request.number,
            init = request.init,
            len = data.len(),
            "Segment downloaded"
        );
        Ok(data)
    }
}

#[async_trait]
impl SegmentFetcher for SegmentLoader {
    async fn fetch_segment(&self, request: &SegmentRequest, token: &CancellationToken) -> Result<Bytes> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ManifestError::Cancelled),
            result = self.load(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use playback_common::create_test_context;

    use super::*;

    fn request(key: Option<SegmentKey>) -> SegmentRequest {
        SegmentRequest {
            url: Url::parse("http://127.0.0.1:9/seg.ts").unwrap(),
            byte_range: None,
            number: 3,
            start: Duration::ZERO,
            duration: Duration::from_secs(6),
            init: false,
            key,
            discontinuity: false,
        }
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let loader = SegmentLoader::new(create_test_context(), ManifestConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            loader.fetch_segment(&request(None), &token).await,
            Err(ManifestError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cached_key_is_reused() {
        let loader = SegmentLoader::new(create_test_context(), ManifestConfig::default());
        let uri = Url::parse("http://127.0.0.1:9/key").unwrap();
        loader.keys.lock().insert(uri.clone(), Bytes::from_static(&[9u8; 16]));
        assert_eq!(loader.key(&uri).await.unwrap().as_ref(), &[9u8; 16]);
    }
}
