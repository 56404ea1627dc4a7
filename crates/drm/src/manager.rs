//! Session registry and packet decryption.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use media_packet::{DrmInitData, EncryptedPacket, Packet};
use parking_lot::{Mutex, RwLock};
use playback_common::PlaybackContext;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    CencSession, ClearKeySystem, DrmConfig, DrmDescription, DrmError, KeySystem, LicenseTransport, Result,
    SessionState,
};

/// Owns one [`CencSession`] per protection scheme and decrypts packets with
/// whichever session holds their key.
pub struct DrmSessionManager {
    config: DrmConfig,
    transport: Arc<dyn LicenseTransport>,
    context: Arc<PlaybackContext>,
    key_systems: RwLock<Vec<Arc<dyn KeySystem>>>,
    descriptions: RwLock<Vec<DrmDescription>>,
    sessions: RwLock<HashMap<String, Arc<CencSession>>>,
    seen_init_data: Mutex<Vec<Bytes>>,
    key_status: Arc<watch::Sender<u64>>,
    unresolved: AtomicBool,
    closed: AtomicBool,
}

impl DrmSessionManager {
    /// Creates a manager with the ClearKey key system registered.
    pub fn new(config: DrmConfig, transport: Arc<dyn LicenseTransport>, context: Arc<PlaybackContext>) -> Self {
        let (key_status, _) = watch::channel(0);
        Self {
            config,
            transport,
            context,
            key_systems: RwLock::new(vec![Arc::new(ClearKeySystem)]),
            descriptions: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
            seen_init_data: Mutex::new(Vec::new()),
            key_status: Arc::new(key_status),
            unresolved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register_key_system(&self, key_system: Arc<dyn KeySystem>) {
        let mut systems = self.key_systems.write();
        systems.retain(|s| s.scheme() != key_system.scheme());
        systems.push(key_system);
    }

    /// Adds the DRM settings of a clip, replacing any description of the
    /// same scheme.
    pub fn add_description(&self, description: DrmDescription) {
        debug!(scheme = %description.scheme, "Registering DRM description");
        let mut descriptions = self.descriptions.write();
        descriptions.retain(|d| !d.matches_scheme(&description.scheme));
        descriptions.push(description);
    }

    pub fn session_state(&self, scheme: &str) -> Option<SessionState> {
        self.sessions.read().get(scheme).map(|s| s.state())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Key status notifications, bumped on every key or session change.
    pub fn key_status(&self) -> watch::Receiver<u64> {
        self.key_status.subscribe()
    }

    fn resolve(&self, init_data: &DrmInitData) -> Option<(Arc<dyn KeySystem>, DrmDescription)> {
        let systems = self.key_systems.read();
        let descriptions = self.descriptions.read();
        let described = |system: &Arc<dyn KeySystem>| {
            descriptions
                .iter()
                .find(|d| d.matches_scheme(system.scheme()))
                .cloned()
                .map(|d| (system.clone(), d))
        };
        match init_data.system_id {
            Some(system_id) => systems
                .iter()
                .filter(|s| s.handles(system_id))
                .find_map(described),
            // Key id lists carry no system id; use the first described scheme
            None => systems.iter().find_map(described),
        }
    }

    /// Opens or updates sessions for the init data announced by a stream.
    ///
    /// Concatenated protection boxes are split by system; each group is
    /// handled once. Groups without a key system or description are skipped
    /// while another group resolves; when none does the call fails with
    /// [`DrmError::InvalidArgument`] and waiting decryptions give up.
    /// Every group is attempted and the first failure is returned.
    pub async fn handle_init_data(&self, init_data: &DrmInitData, token: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrmError::Closed);
        }
        if init_data.is_empty() {
            return Err(DrmError::InvalidArgument("empty init data".to_string()));
        }
        let groups = init_data
            .split_by_system()
            .map_err(|e| DrmError::InvalidInitData(e.to_string()))?;

        let mut first_error = None;
        let mut resolved = false;
        let mut unresolved = None;
        for group in groups {
            if self.seen_init_data.lock().contains(&group.data) {
                trace!(system = ?group.system_id, "Ignoring duplicate init data");
                resolved = true;
                continue;
            }
            let Some((key_system, description)) = self.resolve(&group) else {
                warn!(system = ?group.system_id, "No key system or DRM description for init data");
                unresolved.get_or_insert(group.system_id);
                continue;
            };
            resolved = true;
            self.seen_init_data.lock().push(group.data.clone());

            let result = self.open_session(&group, key_system, description, token).await;
            if let Err(e) = result {
                if matches!(e, DrmError::Cancelled) {
                    // Allow a later retry of the same data
                    self.seen_init_data.lock().retain(|d| *d != group.data);
                }
                first_error.get_or_insert(e);
            }
        }
        if let Some(system) = unresolved.filter(|_| !resolved) {
            self.unresolved.store(true, Ordering::Release);
            self.key_status.send_modify(|v| *v = v.wrapping_add(1));
            let system = system.map_or_else(|| "key id list".to_string(), |id| format!("system {id}"));
            return Err(DrmError::InvalidArgument(format!(
                "no key system or DRM description for {system}"
            )));
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn open_session(
        &self,
        init_data: &DrmInitData,
        key_system: Arc<dyn KeySystem>,
        description: DrmDescription,
        token: &CancellationToken,
    ) -> Result<()> {
        let scheme = key_system.scheme().to_string();
        let session = self
            .sessions
            .write()
            .entry(scheme.clone())
            .or_insert_with(|| {
                info!(%scheme, "Creating DRM session");
                Arc::new(CencSession::new(
                    description,
                    key_system,
                    self.transport.clone(),
                    self.config.clone(),
                    self.key_status.clone(),
                ))
            })
            .clone();

        match session.state() {
            SessionState::Ready => session.update(init_data, token).await,
            SessionState::Error => {
                warn!(%scheme, "DRM session is in error, ignoring init data");
                Err(DrmError::SessionFailed(format!("{scheme} session is in error")))
            }
            SessionState::Uninitialized | SessionState::Initializing => {
                session.initialize(init_data, token).await
            }
        }
    }

    fn session_for(&self, packet: &EncryptedPacket) -> Option<Arc<CencSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.state() == SessionState::Ready && s.has_key(&packet.key_id))
            .cloned()
    }

    fn all_sessions_failed(&self) -> bool {
        let sessions = self.sessions.read();
        !sessions.is_empty() && sessions.values().all(|s| s.state() == SessionState::Error)
    }

    /// Init data arrived that no session could be opened for, and nothing
    /// else has opened one since.
    fn no_session_possible(&self) -> bool {
        self.unresolved.load(Ordering::Acquire) && self.sessions.read().is_empty()
    }

    /// Decrypts `packet`, waiting for its key if no session holds it yet.
    ///
    /// A malformed sample layout fails immediately. A missing key suspends
    /// the call until the next key status change, then it tries again. It
    /// gives up when cancelled, when every session has failed, or when the
    /// init data could not be matched to any DRM description.
    pub async fn decrypt_packet(&self, packet: EncryptedPacket, token: &CancellationToken) -> Result<Packet> {
        packet.validate_layout()?;

        // Subscribe before looking so no key update can slip in between
        let mut status = self.key_status.subscribe();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DrmError::Closed);
            }
            if let Some(session) = self.session_for(&packet) {
                let clear = session.decrypt(packet).await?;
                self.context.update_stats(|s| s.packets_decrypted += 1);
                return Ok(clear);
            }
            if self.all_sessions_failed() {
                return Err(DrmError::SessionFailed(format!(
                    "no usable session for key {}",
                    packet.key_id
                )));
            }
            if self.no_session_possible() {
                return Err(DrmError::InvalidArgument(format!(
                    "no DRM session can provide key {}",
                    packet.key_id
                )));
            }

            debug!(key_id = %packet.key_id, "Waiting for key");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DrmError::Cancelled),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(DrmError::Closed);
                    }
                }
            }
        }
    }

    /// Disposes every session and wakes pending decryptions.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        info!(sessions = sessions.len(), "Closing DRM sessions");
        for session in &sessions {
            session.close();
        }
        self.seen_init_data.lock().clear();
        self.unresolved.store(false, Ordering::Release);
        self.key_status.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DrmSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmSessionManager")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
