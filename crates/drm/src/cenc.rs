//! Common Encryption sample decryption.
//!
//! `cenc` samples use AES-128-CTR with one keystream running across every
//! encrypted range of the sample. `cbcs` samples use AES-128-CBC restarted
//! with the constant IV at each subsample, decrypting `crypt` blocks and
//! leaving `skip` blocks clear; a trailing partial block is always clear.

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, StreamCipher, generic_array::GenericArray};
use media_packet::{EncryptedPacket, EncryptionPattern, EncryptionScheme, Subsample};

use crate::{DrmError, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK: usize = 16;

/// Decrypts the payload of `packet` with `key`.
pub fn decrypt_sample(key: &[u8; 16], packet: &EncryptedPacket) -> Result<Bytes> {
    packet.validate_layout()?;
    let iv = expand_iv(&packet.iv)?;
    let data = &packet.packet.data;
    let out = match packet.scheme {
        EncryptionScheme::Cenc => decrypt_ctr(key, &iv, data, &packet.subsamples),
        EncryptionScheme::Cbcs => decrypt_cbcs(key, &iv, data, &packet.subsamples, packet.pattern)?,
    };
    Ok(Bytes::from(out))
}

/// 8-byte IVs are zero-extended to a full block.
fn expand_iv(iv: &[u8]) -> Result<[u8; 16]> {
    let mut full = [0u8; 16];
    match iv.len() {
        8 | 16 => {
            full[..iv.len()].copy_from_slice(iv);
            Ok(full)
        }
        n => Err(DrmError::Decryption(format!("invalid IV length {n}"))),
    }
}

/// `(offset, len)` of every encrypted range.
fn encrypted_ranges(len: usize, subsamples: &[Subsample]) -> Vec<(usize, usize)> {
    if subsamples.is_empty() {
        return vec![(0, len)];
    }
    let mut ranges = Vec::with_capacity(subsamples.len());
    let mut offset = 0;
    for subsample in subsamples {
        offset += subsample.clear_bytes as usize;
        let encrypted = subsample.encrypted_bytes as usize;
        if encrypted > 0 {
            ranges.push((offset, encrypted));
        }
        offset += encrypted;
    }
    ranges
}

fn decrypt_ctr(key: &[u8; 16], iv: &[u8; 16], data: &[u8], subsamples: &[Subsample]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    for (offset, len) in encrypted_ranges(out.len(), subsamples) {
        cipher.apply_keystream(&mut out[offset..offset + len]);
    }
    out
}

fn decrypt_cbcs(
    key: &[u8; 16],
    iv: &[u8; 16],
    data: &[u8],
    subsamples: &[Subsample],
    pattern: Option<EncryptionPattern>,
) -> Result<Vec<u8>> {
    let mut out = data.to_vec();
    // No pattern, or 0:0, encrypts every full block
    let (crypt, skip) = match pattern {
        Some(p) if p.crypt_blocks > 0 => (p.crypt_blocks as usize, p.skip_blocks as usize),
        Some(p) if p.skip_blocks > 0 => {
            return Err(DrmError::Decryption(format!(
                "pattern 0:{} encrypts nothing",
                p.skip_blocks
            )));
        }
        _ => (usize::MAX, 0),
    };

    for (offset, len) in encrypted_ranges(out.len(), subsamples) {
        let mut cipher = Aes128CbcDec::new(key.into(), iv.into());
        let blocks = len / BLOCK;
        let mut block = 0;
        while block < blocks {
            let run = crypt.min(blocks - block);
            for i in block..block + run {
                let start = offset + i * BLOCK;
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut out[start..start + BLOCK]));
            }
            block += run + skip;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use media_packet::{KeyId, Packet, StreamType};
    use std::time::Duration;

    use super::*;

    // NIST SP 800-38A, F.2.1 (CBC) and F.5.1 (CTR)
    const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const PLAIN_1: &str = "6bc1bee22e409f96e93d7e117393172a";
    const PLAIN_2: &str = "ae2d8a571e03ac9c9eb76fac45af8e51";
    const CBC_IV: &str = "000102030405060708090a0b0c0d0e0f";
    const CBC_1: &str = "7649abac8119b246cee98e9b12e9197d";
    const CBC_2: &str = "5086cb9b507219ee95db113a917678b2";
    const CTR_IV: &str = "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff";
    const CTR_1: &str = "874d6191b620e3261bef6864990db6ce";
    const CTR_2: &str = "9806f66b7970fdff8617187bb9fffdff";

    fn h(value: &str) -> Vec<u8> {
        hex::decode(value).unwrap()
    }

    fn key() -> [u8; 16] {
        h(KEY).try_into().unwrap()
    }

    fn packet(data: Vec<u8>, iv: Vec<u8>, subsamples: Vec<Subsample>) -> EncryptedPacket {
        EncryptedPacket::new(
            Packet::new(StreamType::Video, Duration::ZERO, Duration::ZERO, Bytes::from(data)),
            KeyId([1; 16]),
            Bytes::from(iv),
            subsamples,
        )
    }

    #[test]
    fn test_cenc_keystream_continues_across_subsamples() {
        let data = [b"HDR!".to_vec(), h(CTR_1), b"sei".to_vec(), h(CTR_2)].concat();
        let subsamples = vec![Subsample::new(4, 16), Subsample::new(3, 16)];
        let clear = decrypt_sample(&key(), &packet(data, h(CTR_IV), subsamples)).unwrap();
        let expected = [b"HDR!".to_vec(), h(PLAIN_1), b"sei".to_vec(), h(PLAIN_2)].concat();
        assert_eq!(clear.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_cenc_whole_sample() {
        let data = [h(CTR_1), h(CTR_2)[..5].to_vec()].concat();
        let clear = decrypt_sample(&key(), &packet(data, h(CTR_IV), vec![])).unwrap();
        assert_eq!(&clear[..16], h(PLAIN_1).as_slice());
        assert_eq!(&clear[16..], &h(PLAIN_2)[..5]);
    }

    #[test]
    fn test_cbcs_pattern_skips_blocks_and_tail() {
        let skipped = [0x5au8; 16];
        let tail = [7u8; 5];
        let data = [h(CBC_1), skipped.to_vec(), h(CBC_2), tail.to_vec()].concat();
        let len = data.len() as u32;
        let encrypted = packet(data, h(CBC_IV), vec![Subsample::new(0, len)]).with_scheme(
            EncryptionScheme::Cbcs,
            Some(EncryptionPattern { crypt_blocks: 1, skip_blocks: 1 }),
        );
        let clear = decrypt_sample(&key(), &encrypted).unwrap();
        let expected = [h(PLAIN_1), skipped.to_vec(), h(PLAIN_2), tail.to_vec()].concat();
        assert_eq!(clear.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_cbcs_iv_resets_per_subsample() {
        let data = [vec![1, 2], h(CBC_1), vec![3], h(CBC_1)].concat();
        let subsamples = vec![Subsample::new(2, 16), Subsample::new(1, 16)];
        let encrypted = packet(data, h(CBC_IV), subsamples).with_scheme(EncryptionScheme::Cbcs, None);
        let clear = decrypt_sample(&key(), &encrypted).unwrap();
        let expected = [vec![1, 2], h(PLAIN_1), vec![3], h(PLAIN_1)].concat();
        assert_eq!(clear.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let bad = packet(vec![0; 20], vec![0; 8], vec![Subsample::new(4, 8)]);
        assert!(matches!(
            decrypt_sample(&key(), &bad),
            Err(DrmError::InvalidSubsamples(_))
        ));
    }
}
