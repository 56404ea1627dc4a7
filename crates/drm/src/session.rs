//! A license session for one protection scheme.

use std::collections::HashMap;
use std::sync::Arc;

use media_packet::{DrmInitData, EncryptedPacket, KeyId, Packet};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{DrmConfig, DrmDescription, DrmError, KeySystem, LicenseTransport, Result, cenc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Error,
}

/// License session holding the content keys of one scheme.
///
/// Keys sit behind an `RwLock` so any number of packets can be decrypted
/// concurrently while a key rotation is in progress. Every change of the
/// key set bumps the shared key status counter.
pub struct CencSession {
    description: DrmDescription,
    key_system: Arc<dyn KeySystem>,
    transport: Arc<dyn LicenseTransport>,
    config: DrmConfig,
    state: RwLock<SessionState>,
    keys: RwLock<HashMap<KeyId, [u8; 16]>>,
    license_lock: tokio::sync::Mutex<()>,
    key_status: Arc<watch::Sender<u64>>,
}

impl CencSession {
    pub fn new(
        description: DrmDescription,
        key_system: Arc<dyn KeySystem>,
        transport: Arc<dyn LicenseTransport>,
        config: DrmConfig,
        key_status: Arc<watch::Sender<u64>>,
    ) -> Self {
        Self {
            description,
            key_system,
            transport,
            config,
            state: RwLock::new(SessionState::Uninitialized),
            keys: RwLock::new(HashMap::new()),
            license_lock: tokio::sync::Mutex::new(()),
            key_status,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.description.scheme
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn has_key(&self, key_id: &KeyId) -> bool {
        self.keys.read().contains_key(key_id)
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
        self.key_status.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn license_url(&self) -> Result<Url> {
        let raw = self
            .description
            .license_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| DrmError::InvalidArgument(format!("no license URL for {}", self.scheme())))?;
        let url = Url::parse(raw).map_err(|e| DrmError::InvalidArgument(format!("license URL {raw}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(DrmError::InvalidArgument(format!("license URL scheme {other} is not HTTP"))),
        }
    }

    /// Acquires the first license.
    ///
    /// The license URL and the init data are validated before any request
    /// is made. Any failure other than cancellation moves the session to
    /// [`SessionState::Error`]; a cancelled attempt leaves it uninitialized.
    pub async fn initialize(&self, init_data: &DrmInitData, token: &CancellationToken) -> Result<()> {
        let _guard = self.license_lock.lock().await;
        match self.state() {
            // Another caller finished first; treat the data as a rotation
            SessionState::Ready => return self.rotate(init_data, token).await,
            SessionState::Error => {
                return Err(DrmError::SessionFailed(format!("{} session is in error", self.scheme())));
            }
            SessionState::Uninitialized | SessionState::Initializing => {}
        }

        self.set_state(SessionState::Initializing);
        info!(scheme = self.scheme(), "Initializing DRM session");

        match self.acquire(init_data, token).await {
            Ok(count) => {
                info!(scheme = self.scheme(), keys = count, "DRM session ready");
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(DrmError::Cancelled) => {
                debug!(scheme = self.scheme(), "DRM session initialization cancelled");
                self.set_state(SessionState::Uninitialized);
                Err(DrmError::Cancelled)
            }
            Err(e) => {
                error!(scheme = self.scheme(), error = %e, "DRM session initialization failed");
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Requests the keys of additional init data on a ready session.
    ///
    /// A failed rotation keeps the session and its existing keys usable.
    pub async fn update(&self, init_data: &DrmInitData, token: &CancellationToken) -> Result<()> {
        let _guard = self.license_lock.lock().await;
        if self.state() != SessionState::Ready {
            return Err(DrmError::SessionFailed(format!(
                "{} session is not ready",
                self.scheme()
            )));
        }
        self.rotate(init_data, token).await
    }

    async fn rotate(&self, init_data: &DrmInitData, token: &CancellationToken) -> Result<()> {
        match self.acquire(init_data, token).await {
            Ok(count) => {
                debug!(scheme = self.scheme(), keys = count, "DRM session updated");
                Ok(())
            }
            Err(e) => {
                warn!(scheme = self.scheme(), error = %e, "DRM key update failed");
                Err(e)
            }
        }
    }

    async fn acquire(&self, init_data: &DrmInitData, token: &CancellationToken) -> Result<usize> {
        let license_url = self.license_url()?;
        if init_data.is_empty() {
            return Err(DrmError::InvalidArgument("empty init data".to_string()));
        }
        let request = self.key_system.create_license_request(init_data)?;
        let response = self
            .transport
            .acquire_license(
                &license_url,
                &request,
                &self.description.key_request_properties,
                token,
            )
            .await?;
        let keys = self.key_system.parse_license(&response)?;
        if keys.is_empty() {
            return Err(DrmError::InvalidLicense("license carries no keys".to_string()));
        }
        let missing = request
            .key_ids
            .iter()
            .filter(|kid| !keys.iter().any(|k| k.key_id == **kid))
            .count();
        if missing > 0 {
            warn!(scheme = self.scheme(), missing, "License did not release every requested key");
        }

        let count = keys.len();
        {
            let mut store = self.keys.write();
            for key in keys {
                store.insert(key.key_id, key.key);
            }
        }
        self.key_status.send_modify(|v| *v = v.wrapping_add(1));
        Ok(count)
    }

    /// Decrypts `packet` with the session's key for its key id.
    pub async fn decrypt(&self, packet: EncryptedPacket) -> Result<Packet> {
        let key = self
            .keys
            .read()
            .get(&packet.key_id)
            .copied()
            .ok_or(DrmError::NoKey(packet.key_id))?;

        if self.config.offload_decryption {
            tokio::task::spawn_blocking(move || {
                let data = cenc::decrypt_sample(&key, &packet)?;
                Ok(packet.into_clear(data))
            })
            .await
            .map_err(|e| DrmError::Decryption(format!("decryption task failed: {e}")))?
        } else {
            let data = cenc::decrypt_sample(&key, &packet)?;
            Ok(packet.into_clear(data))
        }
    }

    /// Drops every key. The session must be initialized again to be used.
    pub fn close(&self) {
        let had_keys = {
            let mut keys = self.keys.write();
            let had = !keys.is_empty();
            keys.clear();
            had
        };
        if had_keys || self.state() != SessionState::Uninitialized {
            debug!(scheme = self.scheme(), "Closing DRM session");
            self.set_state(SessionState::Uninitialized);
        }
    }
}

impl Drop for CencSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CencSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CencSession")
            .field("scheme", &self.description.scheme)
            .field("state", &self.state())
            .field("keys", &self.key_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::key_system::tests::{KEY, KID, clearkey_init_data, license};
    use crate::{ClearKeySystem, LicenseRequest};

    /// Replies with scripted responses after an optional delay.
    pub(crate) struct FakeTransport {
        pub(crate) responses: Mutex<Vec<Result<Bytes>>>,
        pub(crate) delay: Duration,
        pub(crate) calls: AtomicUsize,
        pub(crate) last_headers: Mutex<HashMap<String, String>>,
    }

    impl FakeTransport {
        pub(crate) fn new(responses: Vec<Result<Bytes>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                delay,
                calls: AtomicUsize::new(0),
                last_headers: Mutex::new(HashMap::new()),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LicenseTransport for FakeTransport {
        async fn acquire_license(
            &self,
            _license_url: &Url,
            _request: &LicenseRequest,
            headers: &HashMap<String, String>,
            token: &CancellationToken,
        ) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_headers.lock() = headers.clone();
            tokio::select! {
                _ = token.cancelled() => return Err(DrmError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(DrmError::LicenseRejected { status: 500 });
            }
            responses.remove(0)
        }
    }

    fn session(description: DrmDescription, transport: Arc<FakeTransport>) -> CencSession {
        let (status, _) = watch::channel(0);
        CencSession::new(
            description,
            Arc::new(ClearKeySystem),
            transport,
            DrmConfig::default(),
            Arc::new(status),
        )
    }

    fn description() -> DrmDescription {
        DrmDescription::new("clearkey")
            .with_license_url("https://license.test/clearkey")
            .with_property("Authorization", "Bearer t")
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready() {
        let transport = FakeTransport::new(vec![Ok(license(&[(KID, KEY)]))], Duration::ZERO);
        let session = session(description(), transport.clone());
        assert_eq!(session.state(), SessionState::Uninitialized);

        session
            .initialize(&clearkey_init_data(vec![KID]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.has_key(&KID));
        assert_eq!(transport.last_headers.lock()["Authorization"], "Bearer t");

        session.close();
        assert_eq!(session.key_count(), 0);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_network() {
        let transport = FakeTransport::new(vec![], Duration::ZERO);
        let token = CancellationToken::new();

        let no_url = session(DrmDescription::new("clearkey"), transport.clone());
        let err = no_url.initialize(&clearkey_init_data(vec![KID]), &token).await.unwrap_err();
        assert!(matches!(err, DrmError::InvalidArgument(_)));
        assert_eq!(no_url.state(), SessionState::Error);

        let bad_url = session(
            DrmDescription::new("clearkey").with_license_url("not a url"),
            transport.clone(),
        );
        assert!(matches!(
            bad_url.initialize(&clearkey_init_data(vec![KID]), &token).await,
            Err(DrmError::InvalidArgument(_))
        ));

        let empty = session(description(), transport.clone());
        assert!(matches!(
            empty.initialize(&DrmInitData::cenc(Bytes::new()), &token).await,
            Err(DrmError::InvalidArgument(_))
        ));

        let malformed = session(description(), transport.clone());
        let err = malformed
            .initialize(&DrmInitData::cenc(Bytes::from_static(b"garbage")), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DrmError::InvalidInitData(_)));
        assert!(err.is_invalid_input());

        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejection_moves_to_error() {
        let transport = FakeTransport::new(vec![Err(DrmError::LicenseRejected { status: 403 })], Duration::ZERO);
        let session = session(description(), transport);
        let token = CancellationToken::new();
        let err = session.initialize(&clearkey_init_data(vec![KID]), &token).await.unwrap_err();
        assert!(matches!(err, DrmError::LicenseRejected { status: 403 }));
        assert_eq!(session.state(), SessionState::Error);

        // Not recreated implicitly
        assert!(matches!(
            session.initialize(&clearkey_init_data(vec![KID]), &token).await,
            Err(DrmError::SessionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_key_rotation_adds_keys() {
        let rotated = KeyId([0x33; 16]);
        let transport = FakeTransport::new(
            vec![Ok(license(&[(KID, KEY)])), Ok(license(&[(rotated, [5; 16])]))],
            Duration::ZERO,
        );
        let session = session(description(), transport);
        let token = CancellationToken::new();
        session.initialize(&clearkey_init_data(vec![KID]), &token).await.unwrap();
        session.update(&clearkey_init_data(vec![rotated]), &token).await.unwrap();
        assert!(session.has_key(&KID));
        assert!(session.has_key(&rotated));

        // A failed rotation keeps the session usable
        assert!(session.update(&clearkey_init_data(vec![KeyId([9; 16])]), &token).await.is_err());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_initialization_can_be_retried() {
        let transport = FakeTransport::new(vec![Ok(license(&[(KID, KEY)]))], Duration::from_secs(30));
        let session = session(description(), transport);
        let token = CancellationToken::new();
        let init = clearkey_init_data(vec![KID]);

        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(session.initialize(&init, &token), cancel);
        assert!(matches!(result, Err(DrmError::Cancelled)));
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.initialize(&init, &CancellationToken::new()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }
}
