use crate::{Result, TsError};

const STREAM_ID_PROGRAM_STREAM_MAP: u8 = 0xBC;
const STREAM_ID_PADDING: u8 = 0xBE;
const STREAM_ID_PRIVATE_2: u8 = 0xBF;
const STREAM_ID_ECM: u8 = 0xF0;
const STREAM_ID_EMM: u8 = 0xF1;
const STREAM_ID_DSMCC: u8 = 0xF2;
const STREAM_ID_H222_1_E: u8 = 0xF8;
const STREAM_ID_DIRECTORY: u8 = 0xFF;

/// PES packet header with decoded 90 kHz timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// Declared `PES_packet_length` (0 = unbounded, typical for video)
    pub packet_length: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub data_alignment: bool,
    /// Offset of the elementary stream payload from the start code
    pub payload_offset: usize,
}

impl PesHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(TsError::InsufficientData {
                expected: 6,
                actual: data.len(),
            });
        }
        if data[..3] != [0x00, 0x00, 0x01] {
            return Err(TsError::InvalidPesStartCode);
        }
        let stream_id = data[3];
        let packet_length = u16::from_be_bytes([data[4], data[5]]);

        if !has_optional_header(stream_id) {
            return Ok(PesHeader {
                stream_id,
                packet_length,
                pts: None,
                dts: None,
                data_alignment: false,
                payload_offset: 6,
            });
        }

        if data.len() < 9 {
            return Err(TsError::InsufficientData {
                expected: 9,
                actual: data.len(),
            });
        }
        let data_alignment = data[6] & 0x04 != 0;
        let pts_dts_flags = (data[7] >> 6) & 0x03;
        let header_data_length = data[8] as usize;
        let payload_offset = 9 + header_data_length;
        if data.len() < payload_offset {
            return Err(TsError::InsufficientData {
                expected: payload_offset,
                actual: data.len(),
            });
        }

        let (pts, dts) = match pts_dts_flags {
            0b10 if header_data_length >= 5 => (Some(read_timestamp(&data[9..14])), None),
            0b11 if header_data_length >= 10 => (
                Some(read_timestamp(&data[9..14])),
                Some(read_timestamp(&data[14..19])),
            ),
            0b00 => (None, None),
            _ => {
                return Err(TsError::ParseError(format!(
                    "PTS/DTS flags {pts_dts_flags:#04b} with header length {header_data_length}"
                )));
            }
        };

        Ok(PesHeader {
            stream_id,
            packet_length,
            pts,
            dts,
            data_alignment,
            payload_offset,
        })
    }

    pub fn is_video(&self) -> bool {
        (0xE0..=0xEF).contains(&self.stream_id)
    }

    pub fn is_audio(&self) -> bool {
        (0xC0..=0xDF).contains(&self.stream_id) || self.stream_id == 0xBD
    }
}

fn has_optional_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        STREAM_ID_PROGRAM_STREAM_MAP
            | STREAM_ID_PADDING
            | STREAM_ID_PRIVATE_2
            | STREAM_ID_ECM
            | STREAM_ID_EMM
            | STREAM_ID_DSMCC
            | STREAM_ID_H222_1_E
            | STREAM_ID_DIRECTORY
    )
}

fn read_timestamp(b: &[u8]) -> u64 {
    ((b[0] as u64 >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64) >> 1) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64) >> 1
}

/// Encodes a 33-bit timestamp with the given 4-bit prefix (`0b0010` PTS only,
/// `0b0011` PTS of a pair, `0b0001` DTS).
pub fn write_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 15) as u8) << 1) | 1,
        (ts >> 7) as u8,
        ((ts as u8) << 1) | 1,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_only_header() {
        let mut data = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x0A, 0x84, 0x80, 0x05];
        data.extend_from_slice(&write_timestamp(0b0010, 900_000));
        data.extend_from_slice(&[0xAA, 0xBB]);
        let header = PesHeader::parse(&data).unwrap();
        assert!(header.is_audio());
        assert!(header.data_alignment);
        assert_eq!(header.pts, Some(900_000));
        assert_eq!(header.dts, None);
        assert_eq!(header.payload_offset, 14);
        assert_eq!(&data[header.payload_offset..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_pts_and_dts_header() {
        let pts = (1u64 << 33) - 1;
        let mut data = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0xC0, 0x0A];
        data.extend_from_slice(&write_timestamp(0b0011, pts));
        data.extend_from_slice(&write_timestamp(0b0001, 3_600));
        let header = PesHeader::parse(&data).unwrap();
        assert!(header.is_video());
        assert_eq!(header.pts, Some(pts));
        assert_eq!(header.dts, Some(3_600));
    }

    #[test]
    fn test_padding_stream_has_no_optional_header() {
        let data = [0x00, 0x00, 0x01, 0xBE, 0x00, 0x02, 0xFF, 0xFF];
        let header = PesHeader::parse(&data).unwrap();
        assert_eq!(header.payload_offset, 6);
        assert_eq!(header.pts, None);
    }

    #[test]
    fn test_bad_start_code() {
        assert_eq!(
            PesHeader::parse(&[0, 0, 2, 0xE0, 0, 0, 0x80, 0, 0]).unwrap_err(),
            TsError::InvalidPesStartCode
        );
    }
}
