//! HLS `METHOD=AES-128` whole-segment decryption.

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::{ManifestError, Result};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// IV used when the key tag carries none: the media sequence number as a
/// big-endian 128-bit integer.
pub fn sequence_iv(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

/// Decrypts an AES-128-CBC segment and strips its PKCS#7 padding.
pub fn decrypt_segment(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Bytes> {
    if key.len() != 16 {
        return Err(ManifestError::Decryption(format!(
            "AES-128 key must be 16 bytes, got {}",
            key.len()
        )));
    }
    if data.len() % 16 != 0 {
        return Err(ManifestError::Decryption(format!(
            "ciphertext length {} is not a multiple of the block size",
            data.len()
        )));
    }

    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| ManifestError::Decryption(format!("Failed to initialize AES decryptor: {e}")))?;
    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| ManifestError::Decryption(format!("Decryption failed: {e}")))?
        .len();
    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}
