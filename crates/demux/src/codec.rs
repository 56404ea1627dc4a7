//! Codec-level helpers: decoder configuration records, NAL framing and ADTS.

use bytes::{BufMut, Bytes, BytesMut};
use media_packet::Codec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&START_CODE) || data.starts_with(&[0, 0, 1])
}

/// Converts an `avcC`/`hvcC` record into Annex-B parameter sets.
///
/// Extra data that is already Annex-B is returned unchanged. `None` for
/// codecs without in-band parameter sets or malformed records.
pub fn extradata_to_annexb(codec: Codec, extra: &[u8]) -> Option<Bytes> {
    if extra.is_empty() {
        return None;
    }
    if is_annexb(extra) {
        return Some(Bytes::copy_from_slice(extra));
    }
    match codec {
        Codec::H264 => avcc_to_annexb(extra),
        Codec::H265 => hvcc_to_annexb(extra),
        _ => None,
    }
}

fn read_nal<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = u16::from_be_bytes([*data.get(*pos)?, *data.get(*pos + 1)?]) as usize;
    let nal = data.get(*pos + 2..*pos + 2 + len)?;
    *pos += 2 + len;
    Some(nal)
}

fn avcc_to_annexb(extra: &[u8]) -> Option<Bytes> {
    if extra.len() < 7 || extra[0] != 1 {
        return None;
    }
    let mut out = BytesMut::new();
    let mut pos = 5;
    let sps_count = extra[pos] & 0x1F;
    pos += 1;
    for _ in 0..sps_count {
        out.put_slice(&START_CODE);
        out.put_slice(read_nal(extra, &mut pos)?);
    }
    let pps_count = *extra.get(pos)?;
    pos += 1;
    for _ in 0..pps_count {
        out.put_slice(&START_CODE);
        out.put_slice(read_nal(extra, &mut pos)?);
    }
    Some(out.freeze())
}

fn hvcc_to_annexb(extra: &[u8]) -> Option<Bytes> {
    if extra.len() < 23 || extra[0] != 1 {
        return None;
    }
    let mut out = BytesMut::new();
    let arrays = extra[22];
    let mut pos = 23;
    for _ in 0..arrays {
        pos += 1;
        let count = u16::from_be_bytes([*extra.get(pos)?, *extra.get(pos + 1)?]);
        pos += 2;
        for _ in 0..count {
            out.put_slice(&START_CODE);
            out.put_slice(read_nal(extra, &mut pos)?);
        }
    }
    Some(out.freeze())
}

/// NAL length field size declared by an `avcC`/`hvcC` record.
pub fn nal_length_size(codec: Codec, extra: &[u8]) -> Option<usize> {
    if extra.first() != Some(&1) {
        return None;
    }
    match codec {
        Codec::H264 => extra.get(4).map(|b| (b & 0x03) as usize + 1),
        Codec::H265 => extra.get(21).map(|b| (b & 0x03) as usize + 1),
        _ => None,
    }
}

/// Rewrites 4-byte NAL length prefixes as start codes. Byte counts are
/// unchanged, so subsample maps of encrypted samples stay valid. Returns
/// `None` when the lengths do not tile the sample.
pub fn length_prefixed_to_annexb(data: &Bytes) -> Option<Bytes> {
    let mut pos = 0;
    while pos < data.len() {
        let header = data.get(pos..pos + 4)?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        pos = pos.checked_add(4 + len)?;
    }
    if pos != data.len() {
        return None;
    }

    let mut out = BytesMut::from(&data[..]);
    let mut pos = 0;
    while pos < out.len() {
        let len = u32::from_be_bytes([out[pos], out[pos + 1], out[pos + 2], out[pos + 3]]) as usize;
        out[pos..pos + 4].copy_from_slice(&START_CODE);
        pos += 4 + len;
    }
    Some(out.freeze())
}

/// Iterates NAL unit header bytes of an Annex-B buffer.
fn annexb_nal_headers(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut pos = 0;
    std::iter::from_fn(move || {
        while pos + 3 < data.len() {
            if data[pos] == 0 && data[pos + 1] == 0 && data[pos + 2] == 1 {
                pos += 3;
                return data.get(pos).copied();
            }
            pos += 1;
        }
        None
    })
}

/// Whether an Annex-B access unit contains a random access picture.
pub fn annexb_has_keyframe(codec: Codec, data: &[u8]) -> bool {
    match codec {
        Codec::H264 => annexb_nal_headers(data).any(|h| h & 0x1F == 5),
        Codec::H265 => annexb_nal_headers(data).any(|h| (16..=23).contains(&((h >> 1) & 0x3F))),
        _ => true,
    }
}

const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Fields of an ADTS header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtsInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// AudioSpecificConfig equivalent to the header
    pub audio_specific_config: Bytes,
}

pub fn parse_adts(data: &[u8]) -> Option<AdtsInfo> {
    if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF6 != 0xF0 {
        return None;
    }
    let object_type = (data[2] >> 6) + 1;
    let rate_index = (data[2] >> 2) & 0x0F;
    let channels = ((data[2] & 0x01) << 2) | (data[3] >> 6);
    let sample_rate = *ADTS_SAMPLE_RATES.get(rate_index as usize)?;
    let asc = [
        (object_type << 3) | (rate_index >> 1),
        ((rate_index & 0x01) << 7) | (channels << 3),
    ];
    Some(AdtsInfo {
        sample_rate,
        channels: channels as u16,
        audio_specific_config: Bytes::copy_from_slice(&asc),
    })
}
