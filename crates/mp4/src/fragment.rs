//! Movie fragment (`moof`) parsing.

use bytes::Bytes;
use media_packet::{PsshBox, Subsample};

use crate::{Boxes, ByteReader, FourCc, InitSegment, Mp4Error, Result, init::parse_pssh};

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
const TFHD_DEFAULT_DURATION: u32 = 0x08;
const TFHD_DEFAULT_SIZE: u32 = 0x10;
const TFHD_DEFAULT_FLAGS: u32 = 0x20;

const TRUN_DATA_OFFSET: u32 = 0x01;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x04;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_SIZE: u32 = 0x200;
const TRUN_SAMPLE_FLAGS: u32 = 0x400;
const TRUN_SAMPLE_CTS: u32 = 0x800;

const SENC_USE_SUBSAMPLES: u32 = 0x02;

/// PIFF 1.1 sample encryption box extended type.
const PIFF_SENC_UUID: [u8; 16] = [
    0xA2, 0x39, 0x4F, 0x52, 0x5A, 0x9B, 0x4F, 0x14, 0xA2, 0x44, 0x6C, 0x42, 0x7C, 0x64, 0x8D, 0xF4,
];

/// Per-sample encryption parameters from `senc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleEncryption {
    pub iv: Bytes,
    pub subsamples: Vec<Subsample>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSample {
    /// Absolute byte offset of the sample data
    pub offset: u64,
    pub size: u32,
    /// Decode time in track timescale units
    pub dts: u64,
    pub duration: u32,
    pub cts_offset: i32,
    pub is_sync: bool,
    pub encryption: Option<SampleEncryption>,
}

impl FragmentSample {
    pub fn pts(&self) -> i64 {
        self.dts as i64 + self.cts_offset as i64
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackFragment {
    pub track_id: u32,
    pub base_decode_time: Option<u64>,
    pub samples: Vec<FragmentSample>,
}

/// A parsed `moof` box with absolute sample offsets.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    pub sequence_number: u32,
    pub tracks: Vec<TrackFragment>,
    pub pssh: Vec<PsshBox>,
}

impl Fragment {
    /// Parses the payload of a `moof` box that starts at `moof_offset` in the
    /// file. `next_decode_time` supplies the running decode time of tracks
    /// whose fragments lack a `tfdt`.
    pub fn parse(
        payload: &[u8],
        moof_offset: u64,
        init: &InitSegment,
        next_decode_time: impl Fn(u32) -> u64,
    ) -> Result<Self> {
        let mut fragment = Fragment::default();
        for entry in Boxes::new(payload) {
            let (header, body) = entry?;
            match &header.box_type.0 {
                b"mfhd" => {
                    let mut r = ByteReader::new(body);
                    r.full_box_header()?;
                    fragment.sequence_number = r.u32()?;
                }
                b"traf" => {
                    let traf = parse_traf(body, moof_offset, init, &next_decode_time)?;
                    fragment.tracks.push(traf);
                }
                b"pssh" => fragment.pssh.push(parse_pssh(body)?),
                _ => {}
            }
        }
        Ok(fragment)
    }
}

#[derive(Debug, Default)]
struct FragmentHeader {
    track_id: u32,
    base_data_offset: Option<u64>,
    default_duration: Option<u32>,
    default_size: Option<u32>,
    default_flags: Option<u32>,
}

fn parse_tfhd(body: &[u8]) -> Result<FragmentHeader> {
    let mut r = ByteReader::new(body);
    let (_, flags) = r.full_box_header()?;
    let mut tfhd = FragmentHeader {
        track_id: r.u32()?,
        ..FragmentHeader::default()
    };
    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        tfhd.base_data_offset = Some(r.u64()?);
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        r.skip(4)?;
    }
    if flags & TFHD_DEFAULT_DURATION != 0 {
        tfhd.default_duration = Some(r.u32()?);
    }
    if flags & TFHD_DEFAULT_SIZE != 0 {
        tfhd.default_size = Some(r.u32()?);
    }
    if flags & TFHD_DEFAULT_FLAGS != 0 {
        tfhd.default_flags = Some(r.u32()?);
    }
    Ok(tfhd)
}

fn is_sync_sample(flags: u32) -> bool {
    (flags >> 16) & 1 == 0
}

fn parse_traf(
    payload: &[u8],
    moof_offset: u64,
    init: &InitSegment,
    next_decode_time: &impl Fn(u32) -> u64,
) -> Result<TrackFragment> {
    let mut tfhd = None;
    let mut base_decode_time = None;
    let mut runs: Vec<&[u8]> = Vec::new();
    let mut senc: Option<&[u8]> = None;

    for entry in Boxes::new(payload) {
        let (header, body) = entry?;
        match &header.box_type.0 {
            b"tfhd" => tfhd = Some(parse_tfhd(body)?),
            b"tfdt" => {
                let mut r = ByteReader::new(body);
                let (version, _) = r.full_box_header()?;
                base_decode_time = Some(r.versioned_u64(version)?);
            }
            b"trun" => runs.push(body),
            b"senc" => senc = Some(body),
            b"uuid" if header.user_type == Some(PIFF_SENC_UUID) => senc = Some(body),
            _ => {}
        }
    }

    let tfhd = tfhd.ok_or(Mp4Error::MissingBox(FourCc::new(b"tfhd")))?;
    let track = init.track(tfhd.track_id);
    let trex = track.map(|t| t.defaults).unwrap_or_default();
    let default_duration = tfhd.default_duration.unwrap_or(trex.sample_duration);
    let default_size = tfhd.default_size.unwrap_or(trex.sample_size);
    let default_flags = tfhd.default_flags.unwrap_or(trex.sample_flags);
    // Without an explicit base, offsets are relative to the moof both when
    // default-base-is-moof is set and for the first run of a plain traf.
    let base_offset = tfhd.base_data_offset.unwrap_or(moof_offset);

    let mut dts = base_decode_time.unwrap_or_else(|| next_decode_time(tfhd.track_id));
    let mut samples = Vec::new();
    let mut data_cursor = base_offset;

    for run in runs {
        let mut r = ByteReader::new(run);
        let (_, flags) = r.full_box_header()?;
        let count = r.u32()?;
        if flags & TRUN_DATA_OFFSET != 0 {
            let data_offset = r.i32()?;
            data_cursor = base_offset.wrapping_add_signed(data_offset as i64);
        }
        let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
            Some(r.u32()?)
        } else {
            None
        };

        for i in 0..count {
            let duration = if flags & TRUN_SAMPLE_DURATION != 0 {
                r.u32()?
            } else {
                default_duration
            };
            let size = if flags & TRUN_SAMPLE_SIZE != 0 {
                r.u32()?
            } else {
                default_size
            };
            let sample_flags = if flags & TRUN_SAMPLE_FLAGS != 0 {
                r.u32()?
            } else if i == 0
                && let Some(first) = first_flags
            {
                first
            } else {
                default_flags
            };
            let cts_offset = if flags & TRUN_SAMPLE_CTS != 0 {
                r.i32()?
            } else {
                0
            };

            samples.push(FragmentSample {
                offset: data_cursor,
                size,
                dts,
                duration,
                cts_offset,
                is_sync: is_sync_sample(sample_flags),
                encryption: None,
            });
            data_cursor += size as u64;
            dts += duration as u64;
        }
    }

    if let Some(senc) = senc {
        let iv_size = track
            .and_then(|t| t.protection())
            .map(|p| p.default_iv_size)
            .unwrap_or(8);
        let constant_iv = track
            .and_then(|t| t.protection())
            .and_then(|p| p.default_constant_iv.clone());
        let entries = parse_senc(senc, iv_size, samples.len())?;
        for (sample, mut encryption) in samples.iter_mut().zip(entries) {
            if encryption.iv.is_empty()
                && let Some(iv) = &constant_iv
            {
                encryption.iv = iv.clone();
            }
            sample.encryption = Some(encryption);
        }
    }

    Ok(TrackFragment {
        track_id: tfhd.track_id,
        base_decode_time,
        samples,
    })
}

fn parse_senc(payload: &[u8], iv_size: u8, sample_count: usize) -> Result<Vec<SampleEncryption>> {
    let mut r = ByteReader::new(payload);
    let (_, flags) = r.full_box_header()?;
    let count = r.u32()? as usize;
    if count != sample_count {
        return Err(Mp4Error::InvalidBox {
            box_type: FourCc::new(b"senc"),
            reason: format!("{count} entries for {sample_count} samples"),
        });
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let iv = Bytes::copy_from_slice(r.bytes(iv_size as usize)?);
        let mut subsamples = Vec::new();
        if flags & SENC_USE_SUBSAMPLES != 0 {
            let n = r.u16()?;
            for _ in 0..n {
                let clear = r.u16()? as u32;
                let encrypted = r.u32()?;
                subsamples.push(Subsample::new(clear, encrypted));
            }
        }
        entries.push(SampleEncryption { iv, subsamples });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::tests::{encrypted_init, full_box, mp4_box};

    fn be32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn init() -> InitSegment {
        InitSegment::parse(&encrypted_init(1, [7; 16])).unwrap()
    }

    #[test]
    fn test_trun_with_trex_defaults() {
        let tfhd = full_box(b"tfhd", 0, 0x02_0000, &be32(&[1]));
        let tfdt = full_box(b"tfdt", 1, 0, &90_000u64.to_be_bytes());
        let trun = full_box(
            b"trun",
            0,
            TRUN_DATA_OFFSET | TRUN_FIRST_SAMPLE_FLAGS | TRUN_SAMPLE_SIZE,
            &be32(&[3, 100, 0x0200_0000, 10, 20, 30]),
        );
        let traf = mp4_box(b"traf", &[tfhd, tfdt, trun].concat());
        let moof_payload = [full_box(b"mfhd", 0, 0, &be32(&[5])), traf].concat();

        let fragment = Fragment::parse(&moof_payload, 1_000, &init(), |_| 0).unwrap();
        assert_eq!(fragment.sequence_number, 5);
        let track = &fragment.tracks[0];
        assert_eq!(track.base_decode_time, Some(90_000));
        let offsets: Vec<u64> = track.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1_100, 1_110, 1_130]);
        let dts: Vec<u64> = track.samples.iter().map(|s| s.dts).collect();
        assert_eq!(dts, vec![90_000, 93_000, 96_000]);
        // The first sample overrides the non-sync trex default.
        assert!(track.samples[0].is_sync);
        assert!(!track.samples[1].is_sync);
    }

    #[test]
    fn test_missing_tfdt_uses_running_time() {
        let tfhd = full_box(b"tfhd", 0, TFHD_DEFAULT_DURATION, &be32(&[1, 1500]));
        let trun = full_box(b"trun", 0, TRUN_SAMPLE_SIZE, &be32(&[2, 4, 4]));
        let traf = mp4_box(b"traf", &[tfhd, trun].concat());
        let fragment = Fragment::parse(&traf, 0, &init(), |track| u64::from(track) * 42).unwrap();
        let track = &fragment.tracks[0];
        assert_eq!(track.base_decode_time, None);
        assert_eq!(track.samples[0].dts, 42);
        assert_eq!(track.samples[1].dts, 42 + 1500);
    }

    #[test]
    fn test_senc_with_subsamples() {
        let tfhd = full_box(b"tfhd", 0, 0, &be32(&[1]));
        let trun = full_box(b"trun", 0, TRUN_SAMPLE_SIZE, &be32(&[1, 48]));
        let mut senc_body = be32(&[1]);
        senc_body.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        senc_body.extend_from_slice(&1u16.to_be_bytes());
        senc_body.extend_from_slice(&16u16.to_be_bytes());
        senc_body.extend_from_slice(&32u32.to_be_bytes());
        let senc = full_box(b"senc", 0, SENC_USE_SUBSAMPLES, &senc_body);
        let traf = mp4_box(b"traf", &[tfhd, trun, senc].concat());

        let fragment = Fragment::parse(&traf, 0, &init(), |_| 0).unwrap();
        let encryption = fragment.tracks[0].samples[0].encryption.clone().unwrap();
        assert_eq!(&encryption.iv[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(encryption.subsamples, vec![Subsample::new(16, 32)]);
    }

    #[test]
    fn test_senc_count_mismatch() {
        let tfhd = full_box(b"tfhd", 0, 0, &be32(&[1]));
        let trun = full_box(b"trun", 0, TRUN_SAMPLE_SIZE, &be32(&[2, 1, 1]));
        let senc = full_box(b"senc", 0, 0, &[be32(&[1]), vec![0; 8]].concat());
        let traf = mp4_box(b"traf", &[tfhd, trun, senc].concat());
        assert!(matches!(
            Fragment::parse(&traf, 0, &init(), |_| 0),
            Err(Mp4Error::InvalidBox { .. })
        ));
    }
}
