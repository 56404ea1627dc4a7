use media_packet::Codec;

use crate::{Result, TsError, psi::parse_section};

/// PMT `stream_type` values relevant to playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Mpeg1Video,
    Mpeg2Video,
    Mpeg1Audio,
    Mpeg2Audio,
    PrivateSections,
    PrivatePes,
    AdtsAac,
    Mpeg4Visual,
    LatmAac,
    H264,
    H265,
    Ac3,
    Eac3,
    Other(u8),
}

impl From<u8> for StreamType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => StreamType::Mpeg1Video,
            0x02 => StreamType::Mpeg2Video,
            0x03 => StreamType::Mpeg1Audio,
            0x04 => StreamType::Mpeg2Audio,
            0x05 => StreamType::PrivateSections,
            0x06 => StreamType::PrivatePes,
            0x0F => StreamType::AdtsAac,
            0x10 => StreamType::Mpeg4Visual,
            0x11 => StreamType::LatmAac,
            0x1B => StreamType::H264,
            0x24 => StreamType::H265,
            0x81 => StreamType::Ac3,
            0x87 => StreamType::Eac3,
            other => StreamType::Other(other),
        }
    }
}

impl From<StreamType> for u8 {
    fn from(value: StreamType) -> Self {
        match value {
            StreamType::Mpeg1Video => 0x01,
            StreamType::Mpeg2Video => 0x02,
            StreamType::Mpeg1Audio => 0x03,
            StreamType::Mpeg2Audio => 0x04,
            StreamType::PrivateSections => 0x05,
            StreamType::PrivatePes => 0x06,
            StreamType::AdtsAac => 0x0F,
            StreamType::Mpeg4Visual => 0x10,
            StreamType::LatmAac => 0x11,
            StreamType::H264 => 0x1B,
            StreamType::H265 => 0x24,
            StreamType::Ac3 => 0x81,
            StreamType::Eac3 => 0x87,
            StreamType::Other(value) => value,
        }
    }
}

const DESCRIPTOR_REGISTRATION: u8 = 0x05;
const DESCRIPTOR_ISO_639_LANGUAGE: u8 = 0x0A;
const DESCRIPTOR_DVB_AC3: u8 = 0x6A;
const DESCRIPTOR_DVB_EAC3: u8 = 0x7A;

/// Elementary stream entry of a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: StreamType,
    pub elementary_pid: u16,
    /// ISO 639 language code
    pub language: Option<String>,
    /// Registration descriptor format identifier
    pub registration: Option<[u8; 4]>,
    pub descriptor_tags: Vec<u8>,
}

impl PmtStream {
    pub fn new(stream_type: StreamType, elementary_pid: u16) -> Self {
        Self {
            stream_type,
            elementary_pid,
            language: None,
            registration: None,
            descriptor_tags: Vec::new(),
        }
    }

    /// Codec carried by this stream, resolving private PES through descriptors.
    pub fn codec(&self) -> Codec {
        match self.stream_type {
            StreamType::Mpeg1Video | StreamType::Mpeg2Video => Codec::Mpeg2Video,
            StreamType::H264 => Codec::H264,
            StreamType::H265 => Codec::H265,
            StreamType::AdtsAac | StreamType::LatmAac => Codec::Aac,
            StreamType::Mpeg1Audio | StreamType::Mpeg2Audio => Codec::Mp3,
            StreamType::Ac3 => Codec::Ac3,
            StreamType::Eac3 => Codec::Eac3,
            StreamType::PrivatePes => {
                if self.descriptor_tags.contains(&DESCRIPTOR_DVB_AC3) {
                    return Codec::Ac3;
                }
                if self.descriptor_tags.contains(&DESCRIPTOR_DVB_EAC3) {
                    return Codec::Eac3;
                }
                match self.registration.as_ref() {
                    Some(b"AC-3") => Codec::Ac3,
                    Some(b"EAC3") => Codec::Eac3,
                    Some(b"Opus") => Codec::Opus,
                    Some(b"HEVC") => Codec::H265,
                    _ => Codec::Unknown,
                }
            }
            _ => Codec::Unknown,
        }
    }

    fn apply_descriptors(&mut self, mut data: &[u8]) {
        while data.len() >= 2 {
            let tag = data[0];
            let length = data[1] as usize;
            let Some(content) = data.get(2..2 + length) else {
                break;
            };
            self.descriptor_tags.push(tag);
            match tag {
                DESCRIPTOR_ISO_639_LANGUAGE if content.len() >= 3 => {
                    let code = String::from_utf8_lossy(&content[..3]).trim().to_string();
                    if !code.is_empty() {
                        self.language = Some(code);
                    }
                }
                DESCRIPTOR_REGISTRATION if content.len() >= 4 => {
                    self.registration = Some([content[0], content[1], content[2], content[3]]);
                }
                _ => {}
            }
            data = &data[2 + length..];
        }
    }
}

/// Program Map Table (PMT) - Table ID 0x02
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    pub const TABLE_ID: u8 = 0x02;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let section = parse_section(data, Self::TABLE_ID)?;
        let body = section.body;
        if body.len() < 4 {
            return Err(TsError::InsufficientData {
                expected: 4,
                actual: body.len(),
            });
        }
        let pcr_pid = ((body[0] as u16 & 0x1F) << 8) | body[1] as u16;
        let program_info_length = (((body[2] as usize) & 0x0F) << 8) | body[3] as usize;
        let mut offset = 4 + program_info_length;
        if offset > body.len() {
            return Err(TsError::ParseError(format!(
                "program info length {program_info_length} exceeds section"
            )));
        }

        let mut streams = Vec::new();
        while offset + 5 <= body.len() {
            let stream_type = StreamType::from(body[offset]);
            let elementary_pid =
                ((body[offset + 1] as u16 & 0x1F) << 8) | body[offset + 2] as u16;
            let es_info_length =
                (((body[offset + 3] as usize) & 0x0F) << 8) | body[offset + 4] as usize;
            offset += 5;
            let end = offset + es_info_length;
            if end > body.len() {
                return Err(TsError::ParseError(format!(
                    "ES info for PID {elementary_pid} exceeds section"
                )));
            }
            let mut stream = PmtStream::new(stream_type, elementary_pid);
            stream.apply_descriptors(&body[offset..end]);
            streams.push(stream);
            offset = end;
        }

        Ok(Pmt {
            program_number: section.table_id_extension,
            version_number: section.version_number,
            pcr_pid,
            streams,
        })
    }

    pub fn stream(&self, pid: u16) -> Option<&PmtStream> {
        self.streams.iter().find(|s| s.elementary_pid == pid)
    }

    /// Serializes the table body; only language and registration descriptors
    /// are written back.
    pub fn body(&self) -> Vec<u8> {
        let mut body = vec![
            0xE0 | ((self.pcr_pid >> 8) as u8 & 0x1F),
            self.pcr_pid as u8,
            0xF0,
            0x00,
        ];
        for stream in &self.streams {
            let mut descriptors = Vec::new();
            if let Some(language) = &stream.language {
                descriptors.push(DESCRIPTOR_ISO_639_LANGUAGE);
                descriptors.push(4);
                let mut code = [b' '; 3];
                for (slot, byte) in code.iter_mut().zip(language.bytes()) {
                    *slot = byte;
                }
                descriptors.extend_from_slice(&code);
                descriptors.push(0);
            }
            if let Some(registration) = stream.registration {
                descriptors.push(DESCRIPTOR_REGISTRATION);
                descriptors.push(4);
                descriptors.extend_from_slice(&registration);
            }
            body.push(u8::from(stream.stream_type));
            body.push(0xE0 | ((stream.elementary_pid >> 8) as u8 & 0x1F));
            body.push(stream.elementary_pid as u8);
            body.push(0xF0 | ((descriptors.len() >> 8) as u8 & 0x0F));
            body.push(descriptors.len() as u8);
            body.extend_from_slice(&descriptors);
        }
        body
    }
}
