//! # DRM
//!
//! Content protection for the playback pipeline.
//!
//! ## Features
//!
//! - [`DrmSessionManager`]: one session per protection scheme, created from
//!   the init data the demuxer announces, and packet decryption that waits
//!   for missing keys
//! - [`CencSession`]: license acquisition state machine with key rotation
//! - [`KeySystem`] boundary with a W3C ClearKey implementation
//! - [`LicenseTransport`] boundary with an HTTP implementation
//! - `cenc` (AES-CTR) and `cbcs` (AES-CBC pattern) sample decryption
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod cenc;
pub mod config;
pub mod description;
pub mod error;
pub mod key_system;
pub mod manager;
pub mod session;
pub mod transport;

pub use config::{DrmConfig, DrmConfigBuilder};
pub use description::DrmDescription;
pub use error::DrmError;
pub use key_system::{ClearKeySystem, ContentKey, KeySystem, LicenseRequest};
pub use manager::DrmSessionManager;
pub use session::{CencSession, SessionState};
pub use transport::{HttpLicenseTransport, LicenseTransport};

pub type Result<T> = std::result::Result<T, DrmError>;
