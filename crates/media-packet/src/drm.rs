use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::{PacketError, StreamType, pssh};

/// A 16-byte DRM system identifier (the `SystemID` of a `pssh` box).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub [u8; 16]);

impl SystemId {
    pub const WIDEVINE: SystemId = SystemId([
        0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21,
        0xed,
    ]);
    pub const PLAYREADY: SystemId = SystemId([
        0x9a, 0x04, 0xf0, 0x79, 0x98, 0x40, 0x42, 0x86, 0xab, 0x92, 0xe6, 0x5b, 0xe0, 0x88, 0x5f,
        0x95,
    ]);
    /// DASH-IF ClearKey system id.
    pub const CLEARKEY: SystemId = SystemId([
        0xe2, 0x71, 0x9d, 0x58, 0xa9, 0x85, 0xb3, 0xc9, 0x78, 0x1a, 0xb0, 0x30, 0xaf, 0x78, 0xd3,
        0x0e,
    ]);
    /// W3C common `pssh` format, used by ClearKey.
    pub const COMMON: SystemId = SystemId([
        0x10, 0x77, 0xef, 0xec, 0xc0, 0xb2, 0x4d, 0x02, 0xac, 0xe3, 0x3c, 0x1e, 0x52, 0xe2, 0xfb,
        0x4b,
    ]);

    /// Scheme name used in DRM configuration for well-known systems.
    pub fn scheme(&self) -> Option<&'static str> {
        match *self {
            SystemId::WIDEVINE => Some("widevine"),
            SystemId::PLAYREADY => Some("playready"),
            SystemId::CLEARKEY | SystemId::COMMON => Some("clearkey"),
            _ => None,
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<SystemId> {
        match scheme.to_ascii_lowercase().as_str() {
            "widevine" | "com.widevine.alpha" => Some(SystemId::WIDEVINE),
            "playready" | "com.microsoft.playready" => Some(SystemId::PLAYREADY),
            "clearkey" | "org.w3.clearkey" => Some(SystemId::COMMON),
            _ => None,
        }
    }

    /// Parses `urn:uuid:xxxxxxxx-...` or bare hex, with or without dashes.
    pub fn parse(value: &str) -> Result<SystemId, PacketError> {
        parse_uuid(value).map(SystemId)
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_uuid(f, &self.0)
    }
}

impl fmt::Debug for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemId({self})")
    }
}

/// A 16-byte content key identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    pub fn from_slice(bytes: &[u8]) -> Result<KeyId, PacketError> {
        let array: [u8; 16] = bytes.try_into().map_err(|_| PacketError::InsufficientData {
            expected: 16,
            actual: bytes.len(),
        })?;
        Ok(KeyId(array))
    }

    pub fn parse(value: &str) -> Result<KeyId, PacketError> {
        parse_uuid(value).map(KeyId)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

fn parse_uuid(value: &str) -> Result<[u8; 16], PacketError> {
    let trimmed = value.trim();
    let trimmed = trimmed
        .strip_prefix("urn:uuid:")
        .or_else(|| trimmed.strip_prefix("URN:UUID:"))
        .unwrap_or(trimmed);
    let compact: String = trimmed.chars().filter(|c| *c != '-').collect();
    let mut out = [0u8; 16];
    hex::decode_to_slice(&compact, &mut out)
        .map_err(|e| PacketError::InvalidIdentifier(format!("{value}: {e}")))?;
    Ok(out)
}

fn write_uuid(f: &mut fmt::Formatter<'_>, bytes: &[u8; 16]) -> fmt::Result {
    let hex = hex::encode(bytes);
    write!(
        f,
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Format of the bytes carried by [`DrmInitData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDataType {
    /// One or more concatenated `pssh` boxes.
    Cenc,
    /// JSON key id list.
    KeyIds,
    WebM,
}

/// Protection-scheme initialization data announced by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmInitData {
    pub system_id: Option<SystemId>,
    pub data_type: InitDataType,
    pub data: Bytes,
    pub stream_type: Option<StreamType>,
}

impl DrmInitData {
    pub fn cenc(data: Bytes) -> Self {
        Self {
            system_id: None,
            data_type: InitDataType::Cenc,
            data,
            stream_type: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends the boxes of `other` that are not already present.
    ///
    /// Returns `true` when anything was added. Only `Cenc` data is merged.
    pub fn merge(&mut self, other: &DrmInitData) -> Result<bool, PacketError> {
        if self.data_type != InitDataType::Cenc || other.data_type != InitDataType::Cenc {
            return Ok(false);
        }
        let existing: Vec<Bytes> = pssh::split_boxes(&self.data)?;
        let mut buf = BytesMut::from(&self.data[..]);
        let mut added = false;
        for candidate in pssh::split_boxes(&other.data)? {
            if !existing.contains(&candidate) {
                buf.extend_from_slice(&candidate);
                added = true;
            }
        }
        if added {
            self.data = buf.freeze();
            if self.system_id != other.system_id {
                self.system_id = None;
            }
        }
        Ok(added)
    }

    /// Groups the contained `pssh` boxes by system id, dropping exact duplicates.
    ///
    /// Non-`Cenc` data is returned unchanged as a single entry.
    pub fn split_by_system(&self) -> Result<Vec<DrmInitData>, PacketError> {
        if self.data_type != InitDataType::Cenc {
            return Ok(vec![self.clone()]);
        }
        let mut groups: Vec<(SystemId, Vec<Bytes>)> = Vec::new();
        for raw in pssh::split_boxes(&self.data)? {
            let (parsed, _) = pssh::PsshBox::parse(&raw)?;
            match groups.iter_mut().find(|(id, _)| *id == parsed.system_id) {
                Some((_, boxes)) => {
                    if !boxes.contains(&raw) {
                        boxes.push(raw);
                    }
                }
                None => groups.push((parsed.system_id, vec![raw])),
            }
        }
        Ok(groups
            .into_iter()
            .map(|(system_id, boxes)| {
                let mut buf = BytesMut::new();
                for b in boxes {
                    buf.extend_from_slice(&b);
                }
                DrmInitData {
                    system_id: Some(system_id),
                    data_type: InitDataType::Cenc,
                    data: buf.freeze(),
                    stream_type: self.stream_type,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PsshBox;

    #[test]
    fn test_system_id_display_and_parse() {
        let text = SystemId::PLAYREADY.to_string();
        assert_eq!(text, "9a04f079-9840-4286-ab92-e65be0885f95");
        assert_eq!(SystemId::parse(&format!("urn:uuid:{text}")).unwrap(), SystemId::PLAYREADY);
        assert_eq!(
            SystemId::parse("EDEF8BA979D64ACEA3C827DCD51D21ED").unwrap(),
            SystemId::WIDEVINE
        );
        assert!(SystemId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_scheme_names() {
        assert_eq!(SystemId::WIDEVINE.scheme(), Some("widevine"));
        assert_eq!(SystemId::COMMON.scheme(), Some("clearkey"));
        assert_eq!(SystemId::from_scheme("com.microsoft.playready"), Some(SystemId::PLAYREADY));
        assert_eq!(SystemId::from_scheme("fairplay"), None);
    }

    #[test]
    fn test_split_by_system_groups_and_deduplicates() {
        let widevine = PsshBox::new(SystemId::WIDEVINE, vec![], Bytes::from_static(b"wv")).to_bytes();
        let playready = PsshBox::new(SystemId::PLAYREADY, vec![], Bytes::from_static(b"pr")).to_bytes();
        let mut data = BytesMut::new();
        data.extend_from_slice(&widevine);
        data.extend_from_slice(&playready);
        data.extend_from_slice(&widevine);

        let init = DrmInitData::cenc(data.freeze());
        let groups = init.split_by_system().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].system_id, Some(SystemId::WIDEVINE));
        assert_eq!(groups[0].data, widevine);
        assert_eq!(groups[1].system_id, Some(SystemId::PLAYREADY));
    }

    #[test]
    fn test_merge_skips_duplicates() {
        let a = PsshBox::new(SystemId::WIDEVINE, vec![KeyId([1; 16])], Bytes::new()).to_bytes();
        let b = PsshBox::new(SystemId::WIDEVINE, vec![KeyId([2; 16])], Bytes::new()).to_bytes();
        let mut init = DrmInitData::cenc(a.clone());
        assert!(!init.merge(&DrmInitData::cenc(a.clone())).unwrap());
        assert!(init.merge(&DrmInitData::cenc(b.clone())).unwrap());
        assert_eq!(init.data.len(), a.len() + b.len());
    }
}
