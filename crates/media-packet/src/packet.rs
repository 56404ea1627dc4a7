use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::{KeyId, PacketError, StreamType};

/// A demuxed access unit on the millisecond timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_type: StreamType,
    pub pts: Duration,
    pub dts: Duration,
    pub duration: Duration,
    pub is_key_frame: bool,
    pub data: Bytes,
}

impl Packet {
    pub fn new(stream_type: StreamType, pts: Duration, dts: Duration, data: Bytes) -> Self {
        Self {
            stream_type,
            pts,
            dts,
            duration: Duration::ZERO,
            is_key_frame: false,
            data,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_key_frame(mut self, is_key_frame: bool) -> Self {
        self.is_key_frame = is_key_frame;
        self
    }

    /// Places codec configuration bytes in front of the payload.
    pub fn prepend(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(prefix.len() + self.data.len());
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(&self.data);
        self.data = buf.freeze();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One `(clear, encrypted)` byte run of a CENC sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsample {
    pub clear_bytes: u32,
    pub encrypted_bytes: u32,
}

impl Subsample {
    pub fn new(clear_bytes: u32, encrypted_bytes: u32) -> Self {
        Self {
            clear_bytes,
            encrypted_bytes,
        }
    }
}

/// Common Encryption protection scheme of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionScheme {
    /// AES-128 CTR (`cenc`).
    #[default]
    Cenc,
    /// AES-128 CBC with pattern encryption (`cbcs`).
    Cbcs,
}

impl EncryptionScheme {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"cenc" | b"cens" => Some(EncryptionScheme::Cenc),
            b"cbcs" | b"cbc1" => Some(EncryptionScheme::Cbcs),
            _ => None,
        }
    }
}

/// Pattern of encrypted and skipped 16-byte blocks inside a protected range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionPattern {
    pub crypt_blocks: u8,
    pub skip_blocks: u8,
}

/// A packet whose payload is (partially) encrypted.
///
/// When `subsamples` is non-empty their byte counts must add up to the
/// payload length. An empty list means the whole payload is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    pub packet: Packet,
    pub key_id: KeyId,
    pub iv: Bytes,
    pub subsamples: Vec<Subsample>,
    pub scheme: EncryptionScheme,
    pub pattern: Option<EncryptionPattern>,
}

impl EncryptedPacket {
    pub fn new(packet: Packet, key_id: KeyId, iv: Bytes, subsamples: Vec<Subsample>) -> Self {
        Self {
            packet,
            key_id,
            iv,
            subsamples,
            scheme: EncryptionScheme::Cenc,
            pattern: None,
        }
    }

    pub fn with_scheme(mut self, scheme: EncryptionScheme, pattern: Option<EncryptionPattern>) -> Self {
        self.scheme = scheme;
        self.pattern = pattern;
        self
    }

    /// Rejects a packet whose IV or subsample layout cannot describe its payload.
    pub fn validate_layout(&self) -> Result<(), PacketError> {
        if self.iv.len() != 8 && self.iv.len() != 16 {
            return Err(PacketError::InvalidIvLength(self.iv.len()));
        }
        if self.subsamples.is_empty() {
            return Ok(());
        }
        let covered: u64 = self
            .subsamples
            .iter()
            .map(|s| s.clear_bytes as u64 + s.encrypted_bytes as u64)
            .sum();
        if covered != self.packet.data.len() as u64 {
            return Err(PacketError::SubsampleMismatch {
                expected: self.packet.data.len(),
                actual: covered,
            });
        }
        Ok(())
    }

    /// Prepends clear codec configuration bytes, keeping the layout consistent.
    pub fn prepend(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }
        let payload_len = self.packet.data.len() as u32;
        self.packet.prepend(prefix);
        let prefix_len = prefix.len() as u32;
        match self.subsamples.first_mut() {
            Some(first) => first.clear_bytes = first.clear_bytes.saturating_add(prefix_len),
            None => self
                .subsamples
                .push(Subsample::new(prefix_len, payload_len)),
        }
    }

    /// Replaces the payload with its decrypted form and drops the side data.
    pub fn into_clear(self, data: Bytes) -> Packet {
        Packet { data, ..self.packet }
    }
}

/// Output of the demuxer: a clear or an encrypted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPacket {
    Clear(Packet),
    Encrypted(EncryptedPacket),
}

impl MediaPacket {
    pub fn packet(&self) -> &Packet {
        match self {
            MediaPacket::Clear(p) => p,
            MediaPacket::Encrypted(e) => &e.packet,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.packet().stream_type
    }

    pub fn pts(&self) -> Duration {
        self.packet().pts
    }

    pub fn dts(&self) -> Duration {
        self.packet().dts
    }

    pub fn is_key_frame(&self) -> bool {
        self.packet().is_key_frame
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, MediaPacket::Encrypted(_))
    }

    pub fn len(&self) -> usize {
        self.packet().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet().is_empty()
    }

    pub fn prepend(&mut self, prefix: &[u8]) {
        match self {
            MediaPacket::Clear(p) => p.prepend(prefix),
            MediaPacket::Encrypted(e) => e.prepend(prefix),
        }
    }
}

impl From<Packet> for MediaPacket {
    fn from(packet: Packet) -> Self {
        MediaPacket::Clear(packet)
    }
}

impl From<EncryptedPacket> for MediaPacket {
    fn from(packet: EncryptedPacket) -> Self {
        MediaPacket::Encrypted(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(data: &'static [u8]) -> Packet {
        Packet::new(
            StreamType::Video,
            Duration::from_millis(40),
            Duration::from_millis(0),
            Bytes::from_static(data),
        )
    }

    fn encrypted(data: &'static [u8], subsamples: Vec<Subsample>) -> EncryptedPacket {
        EncryptedPacket::new(
            video(data),
            KeyId([7; 16]),
            Bytes::from_static(&[1; 8]),
            subsamples,
        )
    }

    #[test]
    fn test_prepend_places_prefix_first() {
        let mut packet = video(b"frame");
        packet.prepend(b"cfg:");
        assert_eq!(&packet.data[..], b"cfg:frame");
        assert_eq!(packet.pts, Duration::from_millis(40));
    }

    #[test]
    fn test_validate_layout_accepts_matching_subsamples() {
        let packet = encrypted(b"0123456789", vec![Subsample::new(2, 3), Subsample::new(1, 4)]);
        assert!(packet.validate_layout().is_ok());
    }

    #[test]
    fn test_validate_layout_rejects_mismatch() {
        let packet = encrypted(b"0123456789", vec![Subsample::new(2, 3)]);
        assert_eq!(
            packet.validate_layout(),
            Err(PacketError::SubsampleMismatch {
                expected: 10,
                actual: 5
            })
        );
    }

    #[test]
    fn test_validate_layout_rejects_bad_iv() {
        let mut packet = encrypted(b"0123", vec![]);
        packet.iv = Bytes::from_static(&[0; 12]);
        assert_eq!(packet.validate_layout(), Err(PacketError::InvalidIvLength(12)));
    }

    #[test]
    fn test_encrypted_prepend_keeps_invariant() {
        let mut packet = encrypted(b"0123456789", vec![Subsample::new(2, 8)]);
        packet.prepend(b"abc");
        assert_eq!(packet.subsamples[0], Subsample::new(5, 8));
        assert!(packet.validate_layout().is_ok());

        let mut whole = encrypted(b"0123", vec![]);
        whole.prepend(b"xy");
        assert_eq!(whole.subsamples, vec![Subsample::new(2, 4)]);
        assert!(whole.validate_layout().is_ok());
    }

    #[test]
    fn test_into_clear_preserves_timing() {
        let packet = encrypted(b"secret", vec![]);
        let clear = packet.into_clear(Bytes::from_static(b"public"));
        assert_eq!(clear.pts, Duration::from_millis(40));
        assert_eq!(clear.stream_type, StreamType::Video);
        assert_eq!(&clear.data[..], b"public");
    }
}
