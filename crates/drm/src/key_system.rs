//! Key system boundary: builds license requests from init data and extracts
//! content keys from license responses.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use media_packet::{DrmInitData, InitDataType, KeyId, PsshBox, SystemId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DrmError, Result};

/// A content key released by a license.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    pub key_id: KeyId,
    pub key: [u8; 16],
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Body of a license request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRequest {
    pub body: Bytes,
    pub content_type: &'static str,
    /// Key ids the request asks for
    pub key_ids: Vec<KeyId>,
}

pub trait KeySystem: Send + Sync {
    /// Scheme name as used in [`DrmDescription`](crate::DrmDescription)
    fn scheme(&self) -> &str;

    fn system_id(&self) -> SystemId;

    /// Whether init data of the given system belongs to this key system.
    fn handles(&self, system_id: SystemId) -> bool {
        system_id == self.system_id()
    }

    /// Validates `init_data` and builds the license request for it.
    fn create_license_request(&self, init_data: &DrmInitData) -> Result<LicenseRequest>;

    fn parse_license(&self, response: &[u8]) -> Result<Vec<ContentKey>>;
}

/// W3C ClearKey: JSON requests listing base64url key ids, JSON Web Key
/// responses carrying the keys in the clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearKeySystem;

#[derive(Debug, Serialize, Deserialize)]
struct ClearKeyRequest {
    kids: Vec<String>,
    #[serde(rename = "type", default = "temporary")]
    session_type: String,
}

fn temporary() -> String {
    "temporary".to_string()
}

#[derive(Debug, Deserialize)]
struct ClearKeyResponse {
    keys: Vec<JsonWebKey>,
}

#[derive(Debug, Deserialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

fn decode_16(value: &str, what: &str) -> Result<[u8; 16]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| DrmError::InvalidLicense(format!("{what} {value}: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| DrmError::InvalidLicense(format!("{what} has {} bytes, expected 16", b.len())))
}

impl ClearKeySystem {
    fn key_ids(&self, init_data: &DrmInitData) -> Result<Vec<KeyId>> {
        match init_data.data_type {
            InitDataType::Cenc => {
                let boxes = PsshBox::parse_all(&init_data.data)
                    .map_err(|e| DrmError::InvalidInitData(e.to_string()))?;
                let mut key_ids = Vec::new();
                for pssh in boxes.iter().filter(|b| self.handles(b.system_id)) {
                    for kid in &pssh.key_ids {
                        if !key_ids.contains(kid) {
                            key_ids.push(*kid);
                        }
                    }
                }
                Ok(key_ids)
            }
            InitDataType::KeyIds => {
                let request: ClearKeyRequest = serde_json::from_slice(&init_data.data)
                    .map_err(|e| DrmError::InvalidInitData(format!("keyids JSON: {e}")))?;
                request
                    .kids
                    .iter()
                    .map(|kid| {
                        decode_16(kid, "kid")
                            .map(KeyId)
                            .map_err(|e| DrmError::InvalidInitData(e.to_string()))
                    })
                    .collect()
            }
            InitDataType::WebM => Err(DrmError::InvalidInitData(
                "WebM init data is not supported by ClearKey".to_string(),
            )),
        }
    }
}

impl KeySystem for ClearKeySystem {
    fn scheme(&self) -> &str {
        "clearkey"
    }

    fn system_id(&self) -> SystemId {
        SystemId::CLEARKEY
    }

    fn handles(&self, system_id: SystemId) -> bool {
        system_id == SystemId::CLEARKEY || system_id == SystemId::COMMON
    }

    fn create_license_request(&self, init_data: &DrmInitData) -> Result<LicenseRequest> {
        if init_data.is_empty() {
            return Err(DrmError::InvalidArgument("empty init data".to_string()));
        }
        let key_ids = self.key_ids(init_data)?;
        if key_ids.is_empty() {
            return Err(DrmError::InvalidInitData("init data lists no key ids".to_string()));
        }
        let request = ClearKeyRequest {
            kids: key_ids.iter().map(|kid| URL_SAFE_NO_PAD.encode(kid.0)).collect(),
            session_type: temporary(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| DrmError::InvalidInitData(format!("encoding request: {e}")))?;
        debug!(keys = key_ids.len(), "Built ClearKey license request");
        Ok(LicenseRequest {
            body: Bytes::from(body),
            content_type: "application/json",
            key_ids,
        })
    }

    fn parse_license(&self, response: &[u8]) -> Result<Vec<ContentKey>> {
        let response: ClearKeyResponse = serde_json::from_slice(response)
            .map_err(|e| DrmError::InvalidLicense(format!("JSON: {e}")))?;
        response
            .keys
            .iter()
            .filter(|jwk| jwk.kty == "oct")
            .map(|jwk| {
                Ok(ContentKey {
                    key_id: KeyId(decode_16(&jwk.kid, "kid")?),
                    key: decode_16(&jwk.k, "key")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const KID: KeyId = KeyId([0x11; 16]);
    pub(crate) const KEY: [u8; 16] = [0x2b; 16];

    pub(crate) fn clearkey_init_data(key_ids: Vec<KeyId>) -> DrmInitData {
        DrmInitData::cenc(PsshBox::new(SystemId::COMMON, key_ids, Bytes::new()).to_bytes())
    }

    /// License response releasing `keys`.
    pub(crate) fn license(keys: &[(KeyId, [u8; 16])]) -> Bytes {
        let keys: Vec<serde_json::Value> = keys
            .iter()
            .map(|(kid, key)| {
                serde_json::json!({
                    "kty": "oct",
                    "kid": URL_SAFE_NO_PAD.encode(kid.0),
                    "k": URL_SAFE_NO_PAD.encode(key),
                })
            })
            .collect();
        Bytes::from(serde_json::json!({ "keys": keys, "type": "temporary" }).to_string())
    }

    #[test]
    fn test_license_request_round_trip() {
        let system = ClearKeySystem;
        let other = KeyId([0x22; 16]);
        let request = system
            .create_license_request(&clearkey_init_data(vec![KID, other, KID]))
            .unwrap();
        assert_eq!(request.key_ids, vec![KID, other]);
        assert_eq!(request.content_type, "application/json");

        let json: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(json["kids"][0], "EREREREREREREREREREREQ");
        assert_eq!(json["type"], "temporary");

        let keys = system.parse_license(&license(&[(KID, KEY), (other, [1; 16])])).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], ContentKey { key_id: KID, key: KEY });
    }

    #[test]
    fn test_keyids_init_data() {
        let init = DrmInitData {
            system_id: None,
            data_type: InitDataType::KeyIds,
            data: Bytes::from_static(br#"{"kids":["EREREREREREREREREREREQ"]}"#),
            stream_type: None,
        };
        let request = ClearKeySystem.create_license_request(&init).unwrap();
        assert_eq!(request.key_ids, vec![KID]);
    }

    #[test]
    fn test_invalid_init_data() {
        let system = ClearKeySystem;
        let empty = DrmInitData::cenc(Bytes::new());
        assert!(matches!(
            system.create_license_request(&empty),
            Err(DrmError::InvalidArgument(_))
        ));

        let garbage = DrmInitData::cenc(Bytes::from_static(&[0, 0, 0, 40, b'm', b'o', b'o', b'v']));
        assert!(matches!(
            system.create_license_request(&garbage),
            Err(DrmError::InvalidInitData(_))
        ));

        let widevine_only =
            DrmInitData::cenc(PsshBox::new(SystemId::WIDEVINE, vec![KID], Bytes::new()).to_bytes());
        assert!(matches!(
            system.create_license_request(&widevine_only),
            Err(DrmError::InvalidInitData(_))
        ));
    }

    #[test]
    fn test_invalid_license() {
        let system = ClearKeySystem;
        assert!(system.parse_license(b"not json").is_err());
        assert!(system
            .parse_license(br#"{"keys":[{"kty":"oct","kid":"AAAA","k":"AAAA"}]}"#)
            .is_err());
    }
}
