//! Long-form PSI section header shared by the PAT and PMT.

use crate::{Result, TsError, crc::crc32_mpeg2};

/// A validated PSI section. `body` excludes the 8-byte header and the CRC.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    pub table_id: u8,
    pub table_id_extension: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    pub body: &'a [u8],
}

/// Total length of the section starting at `data`, if the header is present.
pub fn section_total_len(data: &[u8]) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    Some(3 + (((data[1] as usize) & 0x0F) << 8 | data[2] as usize))
}

pub fn parse_section(data: &[u8], expected_table_id: u8) -> Result<Section<'_>> {
    if data.len() < 8 {
        return Err(TsError::InsufficientData {
            expected: 8,
            actual: data.len(),
        });
    }
    if data[0] != expected_table_id {
        return Err(TsError::InvalidTableId {
            expected: expected_table_id,
            actual: data[0],
        });
    }
    if data[1] & 0x80 == 0 {
        return Err(TsError::ParseError(
            "section syntax indicator not set".to_string(),
        ));
    }
    let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;
    if section_length < 9 {
        return Err(TsError::InvalidSectionLength(section_length));
    }
    let total = 3 + section_length as usize;
    if data.len() < total {
        return Err(TsError::InsufficientData {
            expected: total,
            actual: data.len(),
        });
    }

    let crc_offset = total - 4;
    let expected = u32::from_be_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);
    let calculated = crc32_mpeg2(&data[..crc_offset]);
    if expected != calculated {
        return Err(TsError::Crc32Mismatch {
            expected,
            calculated,
        });
    }

    Ok(Section {
        table_id: data[0],
        table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
        version_number: (data[5] >> 1) & 0x1F,
        current_next_indicator: data[5] & 0x01 != 0,
        section_number: data[6],
        last_section_number: data[7],
        body: &data[8..crc_offset],
    })
}

/// Builds a complete long-form section around `body`, CRC included.
pub fn build_section(table_id: u8, table_id_extension: u16, version: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut out = Vec::with_capacity(3 + section_length);
    out.push(table_id);
    out.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    out.push(section_length as u8);
    out.extend_from_slice(&table_id_extension.to_be_bytes());
    out.push(0xC1 | ((version & 0x1F) << 1));
    out.push(0);
    out.push(0);
    out.extend_from_slice(body);
    let crc = crc32_mpeg2(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}
