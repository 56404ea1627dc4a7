use bytes::Bytes;
use media_packet::{Codec, EncryptionPattern, EncryptionScheme, KeyId, PsshBox, SystemId};

use crate::{
    Boxes, ByteReader, FourCc, Mp4Error, Result, SampleTable, SampleTableBuilder,
    reader::find_box,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Audio,
    Subtitle,
    Other(FourCc),
}

impl From<FourCc> for HandlerType {
    fn from(code: FourCc) -> Self {
        match &code.0 {
            b"vide" => HandlerType::Video,
            b"soun" => HandlerType::Audio,
            b"text" | b"subt" | b"sbtl" => HandlerType::Subtitle,
            _ => HandlerType::Other(code),
        }
    }
}

/// `trex` defaults applied to fragments of a track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackDefaults {
    pub sample_description_index: u32,
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
}

/// Track protection from `sinf`/`schm`/`tenc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackProtection {
    pub scheme: EncryptionScheme,
    pub default_is_protected: bool,
    pub default_iv_size: u8,
    pub default_kid: KeyId,
    pub default_constant_iv: Option<Bytes>,
    pub pattern: Option<EncryptionPattern>,
}

/// First sample entry of `stsd`, with the original format of encrypted entries.
#[derive(Debug, Clone, Default)]
pub struct SampleDescription {
    pub format: FourCc,
    pub codec: Codec,
    pub width: u16,
    pub height: u16,
    pub channels: u16,
    pub sample_size: u16,
    pub sample_rate: u32,
    /// `avcC`/`hvcC` record, AudioSpecificConfig or other decoder config
    pub extra_data: Bytes,
    pub avg_bitrate: u32,
    pub protection: Option<TrackProtection>,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u32,
    pub handler: HandlerType,
    pub timescale: u32,
    pub duration: u64,
    pub language: Option<String>,
    pub description: SampleDescription,
    pub defaults: TrackDefaults,
    /// Media time of the first edit, subtracted from sample times
    pub edit_media_time: Option<i64>,
    /// Progressive sample table; empty for fragmented files
    pub samples: SampleTable,
}

impl Track {
    pub fn protection(&self) -> Option<&TrackProtection> {
        self.description.protection.as_ref()
    }
}

/// Parsed `moov` box.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub timescale: u32,
    pub duration: u64,
    /// `mehd` duration of a fragmented presentation
    pub fragment_duration: Option<u64>,
    pub fragmented: bool,
    pub tracks: Vec<Track>,
    pub pssh: Vec<PsshBox>,
}

impl InitSegment {
    /// Finds and parses the `moov` box among top-level boxes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        match find_box(data, b"moov")? {
            Some(moov) => Self::parse_moov(moov),
            None => Err(Mp4Error::MissingBox(FourCc::new(b"moov"))),
        }
    }

    pub fn parse_moov(payload: &[u8]) -> Result<Self> {
        let mut init = InitSegment {
            timescale: 1000,
            duration: 0,
            fragment_duration: None,
            fragmented: false,
            tracks: Vec::new(),
            pssh: Vec::new(),
        };
        let mut trex: Vec<(u32, TrackDefaults)> = Vec::new();

        for entry in Boxes::new(payload) {
            let (header, body) = entry?;
            match &header.box_type.0 {
                b"mvhd" => {
                    let mut r = ByteReader::new(body);
                    let (version, _) = r.full_box_header()?;
                    r.versioned_u64(version)?;
                    r.versioned_u64(version)?;
                    init.timescale = r.u32()?;
                    init.duration = r.versioned_u64(version)?;
                }
                b"trak" => {
                    if let Some(track) = parse_trak(body)? {
                        init.tracks.push(track);
                    }
                }
                b"mvex" => {
                    init.fragmented = true;
                    for child in Boxes::new(body) {
                        let (child_header, child_body) = child?;
                        let mut r = ByteReader::new(child_body);
                        match &child_header.box_type.0 {
                            b"trex" => {
                                r.full_box_header()?;
                                let track_id = r.u32()?;
                                trex.push((
                                    track_id,
                                    TrackDefaults {
                                        sample_description_index: r.u32()?,
                                        sample_duration: r.u32()?,
                                        sample_size: r.u32()?,
                                        sample_flags: r.u32()?,
                                    },
                                ));
                            }
                            b"mehd" => {
                                let (version, _) = r.full_box_header()?;
                                init.fragment_duration = Some(r.versioned_u64(version)?);
                            }
                            _ => {}
                        }
                    }
                }
                b"pssh" => init.pssh.push(parse_pssh(body)?),
                _ => {}
            }
        }

        for (track_id, defaults) in trex {
            if let Some(track) = init.tracks.iter_mut().find(|t| t.track_id == track_id) {
                track.defaults = defaults;
            }
        }
        Ok(init)
    }

    pub fn track(&self, track_id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }
}

/// Parses the payload of a `pssh` box (everything after the box header).
pub fn parse_pssh(payload: &[u8]) -> Result<PsshBox> {
    let mut r = ByteReader::new(payload);
    let (version, _) = r.full_box_header()?;
    let mut system_id = [0u8; 16];
    system_id.copy_from_slice(r.bytes(16)?);
    let mut key_ids = Vec::new();
    if version > 0 {
        let count = r.u32()?;
        for _ in 0..count {
            let mut kid = [0u8; 16];
            kid.copy_from_slice(r.bytes(16)?);
            key_ids.push(KeyId(kid));
        }
    }
    let size = r.u32()? as usize;
    let data = Bytes::copy_from_slice(r.bytes(size)?);
    Ok(PsshBox::new(SystemId(system_id), key_ids, data))
}

fn parse_trak(payload: &[u8]) -> Result<Option<Track>> {
    let mut track_id = None;
    let mut edit_media_time = None;
    let mut media = None;

    for entry in Boxes::new(payload) {
        let (header, body) = entry?;
        match &header.box_type.0 {
            b"tkhd" => {
                let mut r = ByteReader::new(body);
                let (version, _) = r.full_box_header()?;
                r.versioned_u64(version)?;
                r.versioned_u64(version)?;
                track_id = Some(r.u32()?);
            }
            b"edts" => {
                if let Some(elst) = find_box(body, b"elst")? {
                    edit_media_time = parse_first_edit(elst)?;
                }
            }
            b"mdia" => media = Some(parse_mdia(body)?),
            _ => {}
        }
    }

    let (Some(track_id), Some(media)) = (track_id, media) else {
        return Ok(None);
    };
    Ok(Some(Track {
        track_id,
        handler: media.handler,
        timescale: media.timescale,
        duration: media.duration,
        language: media.language,
        description: media.description,
        defaults: TrackDefaults::default(),
        edit_media_time,
        samples: media.samples,
    }))
}

fn parse_first_edit(payload: &[u8]) -> Result<Option<i64>> {
    let mut r = ByteReader::new(payload);
    let (version, _) = r.full_box_header()?;
    let count = r.u32()?;
    for _ in 0..count {
        let (_duration, media_time) = if version == 1 {
            (r.u64()?, r.u64()? as i64)
        } else {
            (r.u32()? as u64, r.i32()? as i64)
        };
        r.skip(4)?;
        // An empty edit (-1) delays presentation; the next entry carries the offset.
        if media_time >= 0 {
            return Ok(Some(media_time));
        }
    }
    Ok(None)
}

struct Media {
    handler: HandlerType,
    timescale: u32,
    duration: u64,
    language: Option<String>,
    description: SampleDescription,
    samples: SampleTable,
}

fn parse_mdia(payload: &[u8]) -> Result<Media> {
    let mut media = Media {
        handler: HandlerType::Other(FourCc::default()),
        timescale: 1000,
        duration: 0,
        language: None,
        description: SampleDescription::default(),
        samples: SampleTable::default(),
    };

    for entry in Boxes::new(payload) {
        let (header, body) = entry?;
        match &header.box_type.0 {
            b"mdhd" => {
                let mut r = ByteReader::new(body);
                let (version, _) = r.full_box_header()?;
                r.versioned_u64(version)?;
                r.versioned_u64(version)?;
                media.timescale = r.u32()?;
                media.duration = r.versioned_u64(version)?;
                media.language = decode_language(r.u16()?);
            }
            b"hdlr" => {
                let mut r = ByteReader::new(body);
                r.full_box_header()?;
                r.skip(4)?;
                media.handler = HandlerType::from(r.fourcc()?);
            }
            b"minf" => {
                if let Some(stbl) = find_box(body, b"stbl")? {
                    let mut builder = SampleTableBuilder::default();
                    for child in Boxes::new(stbl) {
                        let (child_header, child_body) = child?;
                        if child_header.box_type == b"stsd" {
                            media.description = parse_stsd(child_body)?;
                        } else {
                            builder.add_box(&child_header.box_type.0, child_body)?;
                        }
                    }
                    media.samples = builder.build();
                }
            }
            _ => {}
        }
    }
    Ok(media)
}

fn decode_language(packed: u16) -> Option<String> {
    let chars = [
        ((packed >> 10) & 0x1F) as u8 + 0x60,
        ((packed >> 5) & 0x1F) as u8 + 0x60,
        (packed & 0x1F) as u8 + 0x60,
    ];
    if !chars.iter().all(u8::is_ascii_lowercase) {
        return None;
    }
    let code = String::from_utf8_lossy(&chars).into_owned();
    (code != "und").then_some(code)
}

fn parse_stsd(payload: &[u8]) -> Result<SampleDescription> {
    let mut r = ByteReader::new(payload);
    r.full_box_header()?;
    let count = r.u32()?;
    if count == 0 {
        return Ok(SampleDescription::default());
    }
    match Boxes::new(r.rest()).next() {
        Some(entry) => {
            let (header, body) = entry?;
            parse_sample_entry(header.box_type, body)
        }
        None => Ok(SampleDescription::default()),
    }
}

const VISUAL_ENTRY_LEN: usize = 78;
const AUDIO_ENTRY_LEN: usize = 28;

fn parse_sample_entry(format: FourCc, body: &[u8]) -> Result<SampleDescription> {
    let mut desc = SampleDescription {
        format,
        ..SampleDescription::default()
    };
    let children = match &format.0 {
        b"avc1" | b"avc3" | b"hvc1" | b"hev1" | b"av01" | b"vp09" | b"encv" => {
            let mut r = ByteReader::new(body);
            r.skip(24)?;
            desc.width = r.u16()?;
            desc.height = r.u16()?;
            body.get(VISUAL_ENTRY_LEN..).unwrap_or_default()
        }
        b"mp4a" | b"ac-3" | b"ec-3" | b"Opus" | b".mp3" | b"enca" => {
            let mut r = ByteReader::new(body);
            r.skip(8)?;
            let version = r.u16()?;
            r.skip(6)?;
            desc.channels = r.u16()?;
            desc.sample_size = r.u16()?;
            r.skip(4)?;
            desc.sample_rate = r.u32()? >> 16;
            let extra = match version {
                1 => 16,
                2 => 36,
                _ => 0,
            };
            body.get(AUDIO_ENTRY_LEN + extra..).unwrap_or_default()
        }
        _ => return Ok(desc),
    };

    for entry in Boxes::new(children) {
        let (header, child) = entry?;
        match &header.box_type.0 {
            b"avcC" | b"hvcC" | b"av1C" | b"vpcC" | b"dac3" | b"dec3" | b"dOps" => {
                desc.extra_data = Bytes::copy_from_slice(child);
            }
            b"esds" => parse_esds(child, &mut desc)?,
            b"btrt" => {
                let mut r = ByteReader::new(child);
                r.skip(8)?;
                desc.avg_bitrate = r.u32()?;
            }
            b"sinf" => {
                let (original, protection) = parse_sinf(child)?;
                if let Some(original) = original {
                    desc.format = original;
                }
                desc.protection = protection;
            }
            _ => {}
        }
    }
    desc.codec = Codec::from_fourcc(&desc.format.as_str());
    Ok(desc)
}

fn read_descriptor_header(r: &mut ByteReader<'_>) -> Result<(u8, usize)> {
    let tag = r.u8()?;
    let mut size = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        size = (size << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, size))
}

fn parse_esds(payload: &[u8], desc: &mut SampleDescription) -> Result<()> {
    let mut r = ByteReader::new(payload);
    r.full_box_header()?;
    let (tag, _) = read_descriptor_header(&mut r)?;
    if tag != 0x03 {
        return Err(Mp4Error::InvalidBox {
            box_type: FourCc::new(b"esds"),
            reason: format!("expected ES_Descriptor, found tag {tag:#04x}"),
        });
    }
    r.skip(2)?;
    let flags = r.u8()?;
    if flags & 0x80 != 0 {
        r.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = r.u8()? as usize;
        r.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        r.skip(2)?;
    }

    let (tag, _) = read_descriptor_header(&mut r)?;
    if tag != 0x04 {
        return Ok(());
    }
    let object_type = r.u8()?;
    r.skip(1 + 3 + 4)?;
    let avg_bitrate = r.u32()?;
    if avg_bitrate > 0 {
        desc.avg_bitrate = avg_bitrate;
    }
    if matches!(object_type, 0x69 | 0x6B) {
        desc.format = FourCc::new(b".mp3");
    }

    if r.remaining() >= 2 {
        let (tag, size) = read_descriptor_header(&mut r)?;
        if tag == 0x05 {
            desc.extra_data = Bytes::copy_from_slice(r.bytes(size)?);
        }
    }
    Ok(())
}

fn parse_sinf(payload: &[u8]) -> Result<(Option<FourCc>, Option<TrackProtection>)> {
    let mut original = None;
    let mut scheme = EncryptionScheme::Cenc;
    let mut protection = None;

    for entry in Boxes::new(payload) {
        let (header, body) = entry?;
        match &header.box_type.0 {
            b"frma" => original = Some(ByteReader::new(body).fourcc()?),
            b"schm" => {
                let mut r = ByteReader::new(body);
                r.full_box_header()?;
                let scheme_type = r.fourcc()?;
                scheme = EncryptionScheme::from_fourcc(&scheme_type.0).ok_or_else(|| {
                    Mp4Error::Unsupported(format!("protection scheme '{scheme_type}'"))
                })?;
            }
            b"schi" => {
                if let Some(tenc) = find_box(body, b"tenc")? {
                    protection = Some(parse_tenc(tenc)?);
                }
            }
            _ => {}
        }
    }

    if let Some(p) = protection.as_mut() {
        p.scheme = scheme;
    }
    Ok((original, protection))
}

fn parse_tenc(payload: &[u8]) -> Result<TrackProtection> {
    let mut r = ByteReader::new(payload);
    let (version, _) = r.full_box_header()?;
    r.skip(1)?;
    let pattern_byte = r.u8()?;
    let pattern = (version > 0).then_some(EncryptionPattern {
        crypt_blocks: pattern_byte >> 4,
        skip_blocks: pattern_byte & 0x0F,
    });
    let default_is_protected = r.u8()? == 1;
    let default_iv_size = r.u8()?;
    let default_kid = KeyId::from_slice(r.bytes(16)?).map_err(|e| Mp4Error::InvalidBox {
        box_type: FourCc::new(b"tenc"),
        reason: e.to_string(),
    })?;
    let default_constant_iv = if default_is_protected && default_iv_size == 0 {
        let size = r.u8()? as usize;
        Some(Bytes::copy_from_slice(r.bytes(size)?))
    } else {
        None
    };
    Ok(TrackProtection {
        scheme: EncryptionScheme::Cenc,
        default_is_protected,
        default_iv_size,
        default_kid,
        default_constant_iv,
        pattern,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn mp4_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn full_box(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![version, (flags >> 16) as u8, (flags >> 8) as u8, flags as u8];
        body.extend_from_slice(payload);
        mp4_box(box_type, &body)
    }

    fn be32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn video_entry(format: &[u8; 4], children: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; VISUAL_ENTRY_LEN];
        body[24..26].copy_from_slice(&1280u16.to_be_bytes());
        body[26..28].copy_from_slice(&720u16.to_be_bytes());
        body.extend_from_slice(children);
        mp4_box(format, &body)
    }

    /// Builds an encrypted single-track AVC init segment.
    pub(crate) fn encrypted_init(track_id: u32, kid: [u8; 16]) -> Vec<u8> {
        let mut tenc_body = vec![0, 0, 1, 8];
        tenc_body.extend_from_slice(&kid);
        let sinf = mp4_box(
            b"sinf",
            &[
                mp4_box(b"frma", b"avc1"),
                full_box(b"schm", 0, 0, &[b'c', b'e', b'n', b'c', 0, 1, 0, 0]),
                mp4_box(b"schi", &full_box(b"tenc", 0, 0, &tenc_body)),
            ]
            .concat(),
        );
        let avcc = mp4_box(b"avcC", &[1, 0x64, 0, 0x1F, 0xFF, 0xE0, 0x00]);
        let entry = video_entry(b"encv", &[avcc, sinf].concat());
        let stsd = full_box(b"stsd", 0, 0, &[be32(&[1]), entry].concat());
        let empty_tables = [
            full_box(b"stts", 0, 0, &be32(&[0])),
            full_box(b"stsc", 0, 0, &be32(&[0])),
            full_box(b"stsz", 0, 0, &be32(&[0, 0])),
            full_box(b"stco", 0, 0, &be32(&[0])),
        ]
        .concat();
        let stbl = mp4_box(b"stbl", &[stsd, empty_tables].concat());
        let minf = mp4_box(b"minf", &stbl);
        let mut mdhd = be32(&[0, 0, 90_000, 0]);
        mdhd.extend_from_slice(&[0x15, 0xC7, 0, 0]);
        let mdia = mp4_box(
            b"mdia",
            &[
                full_box(b"mdhd", 0, 0, &mdhd),
                full_box(b"hdlr", 0, 0, &[be32(&[0]), b"vide".to_vec(), vec![0; 13]].concat()),
                minf,
            ]
            .concat(),
        );
        let tkhd = full_box(b"tkhd", 0, 7, &[be32(&[0, 0, track_id]), vec![0; 68]].concat());
        let trak = mp4_box(b"trak", &[tkhd, mdia].concat());
        let trex = full_box(b"trex", 0, 0, &be32(&[track_id, 1, 3000, 0, 0x0101_0000]));
        let mvex = mp4_box(b"mvex", &trex);
        let pssh = full_box(
            b"pssh",
            1,
            0,
            &[SystemId::COMMON.0.to_vec(), be32(&[1]), kid.to_vec(), be32(&[0])].concat(),
        );
        let mvhd = full_box(b"mvhd", 0, 0, &[be32(&[0, 0, 1000, 0]), vec![0; 80]].concat());
        let moov = mp4_box(b"moov", &[mvhd, trak, mvex, pssh].concat());
        [mp4_box(b"ftyp", b"iso6\0\0\0\0"), moov].concat()
    }

    #[test]
    fn test_parse_encrypted_init_segment() {
        let kid = [0x42; 16];
        let init = InitSegment::parse(&encrypted_init(1, kid)).unwrap();
        assert!(init.fragmented);
        assert_eq!(init.tracks.len(), 1);

        let track = &init.tracks[0];
        assert_eq!(track.track_id, 1);
        assert_eq!(track.handler, HandlerType::Video);
        assert_eq!(track.timescale, 90_000);
        assert_eq!(track.language.as_deref(), Some("eng"));
        assert_eq!(track.defaults.sample_duration, 3000);
        assert_eq!(track.description.codec, Codec::H264);
        assert_eq!(track.description.format, FourCc::new(b"avc1"));
        assert_eq!((track.description.width, track.description.height), (1280, 720));
        assert_eq!(track.description.extra_data[0], 1);

        let protection = track.protection().unwrap();
        assert_eq!(protection.scheme, EncryptionScheme::Cenc);
        assert_eq!(protection.default_kid, KeyId(kid));
        assert_eq!(protection.default_iv_size, 8);

        assert_eq!(init.pssh.len(), 1);
        assert_eq!(init.pssh[0].system_id, SystemId::COMMON);
        assert_eq!(init.pssh[0].key_ids, vec![KeyId(kid)]);
    }

    #[test]
    fn test_missing_moov() {
        let data = mp4_box(b"ftyp", b"isom\0\0\0\0");
        assert_eq!(
            InitSegment::parse(&data).unwrap_err(),
            Mp4Error::MissingBox(FourCc::new(b"moov"))
        );
    }

    #[test]
    fn test_esds_audio_specific_config() {
        let esds_payload = [
            0x03, 0x19, 0x00, 0x01, 0x00, // ES_Descriptor
            0x04, 0x11, 0x40, 0x15, 0x00, 0x00, 0x00, 0x00, 0x01, 0xF4, 0x00, 0x00, 0x01, 0xF4,
            0x00, // DecoderConfigDescriptor
            0x05, 0x02, 0x11, 0x90, // AudioSpecificConfig
        ];
        let esds = full_box(b"esds", 0, 0, &esds_payload);
        let mut entry = vec![0u8; AUDIO_ENTRY_LEN];
        entry[16..18].copy_from_slice(&2u16.to_be_bytes());
        entry[18..20].copy_from_slice(&16u16.to_be_bytes());
        entry[24..28].copy_from_slice(&(48_000u32 << 16).to_be_bytes());
        entry.extend_from_slice(&esds);

        let desc = parse_sample_entry(FourCc::new(b"mp4a"), &entry).unwrap();
        assert_eq!(desc.codec, Codec::Aac);
        assert_eq!(desc.channels, 2);
        assert_eq!(desc.sample_rate, 48_000);
        assert_eq!(desc.avg_bitrate, 128_000);
        assert_eq!(&desc.extra_data[..], &[0x11, 0x90]);
    }
}
