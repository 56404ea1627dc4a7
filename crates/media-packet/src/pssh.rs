//! `pssh` (Protection System Specific Header) box codec.
//!
//! Layout written by [`PsshBox::to_bytes`]:
//!
//! ```text
//! u32  box length (big-endian)
//! [4]  "pssh"
//! u32  version/flags: 0x01000000 when key ids are present, else 0
//! [16] system id
//! u32  key id count          } only when key ids are present
//! [16] key id * count        }
//! u32  data size (0 when there is no data)
//! [..] data
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::{KeyId, PacketError, SystemId};

pub const PSSH_BOX_TYPE: [u8; 4] = *b"pssh";

const HEADER_LEN: usize = 8;
const FIXED_LEN: usize = HEADER_LEN + 4 + 16 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsshBox {
    pub system_id: SystemId,
    pub key_ids: Vec<KeyId>,
    pub data: Bytes,
}

impl PsshBox {
    pub fn new(system_id: SystemId, key_ids: Vec<KeyId>, data: Bytes) -> Self {
        Self {
            system_id,
            key_ids,
            data,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let kids = if self.key_ids.is_empty() {
            0
        } else {
            4 + 16 * self.key_ids.len()
        };
        FIXED_LEN + kids + self.data.len()
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.encoded_len() as u32);
        buf.put_slice(&PSSH_BOX_TYPE);
        if self.key_ids.is_empty() {
            buf.put_u32(0);
        } else {
            buf.put_u32(0x0100_0000);
        }
        buf.put_slice(&self.system_id.0);
        if !self.key_ids.is_empty() {
            buf.put_u32(self.key_ids.len() as u32);
            for kid in &self.key_ids {
                buf.put_slice(&kid.0);
            }
        }
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Parses one box from the start of `data`, returning it with its length.
    pub fn parse(data: &[u8]) -> Result<(PsshBox, usize), PacketError> {
        if data.len() < FIXED_LEN {
            return Err(PacketError::InsufficientData {
                expected: FIXED_LEN,
                actual: data.len(),
            });
        }
        let declared = read_u32(data, 0) as usize;
        if declared < FIXED_LEN {
            return Err(PacketError::InvalidBox(format!(
                "pssh length {declared} is shorter than the fixed header"
            )));
        }
        if declared > data.len() {
            return Err(PacketError::InsufficientData {
                expected: declared,
                actual: data.len(),
            });
        }
        if data[4..8] != PSSH_BOX_TYPE {
            return Err(PacketError::InvalidBox(format!(
                "unexpected box type {:?}",
                String::from_utf8_lossy(&data[4..8])
            )));
        }
        let body = &data[..declared];
        let version = body[8];
        let mut system_id = [0u8; 16];
        system_id.copy_from_slice(&body[12..28]);

        let mut offset = 28;
        let mut key_ids = Vec::new();
        if version > 0 {
            let count = read_checked_u32(body, offset)? as usize;
            offset += 4;
            let needed = count
                .checked_mul(16)
                .ok_or_else(|| PacketError::InvalidBox("key id count overflow".to_string()))?;
            if offset + needed > body.len() {
                return Err(PacketError::InsufficientData {
                    expected: offset + needed,
                    actual: body.len(),
                });
            }
            for chunk in body[offset..offset + needed].chunks_exact(16) {
                key_ids.push(KeyId::from_slice(chunk)?);
            }
            offset += needed;
        }

        let data_size = read_checked_u32(body, offset)? as usize;
        offset += 4;
        if offset + data_size > body.len() {
            return Err(PacketError::InsufficientData {
                expected: offset + data_size,
                actual: body.len(),
            });
        }
        let payload = Bytes::copy_from_slice(&body[offset..offset + data_size]);

        Ok((
            PsshBox {
                system_id: SystemId(system_id),
                key_ids,
                data: payload,
            },
            declared,
        ))
    }

    /// Parses every box of a concatenation.
    pub fn parse_all(data: &[u8]) -> Result<Vec<PsshBox>, PacketError> {
        let mut boxes = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (parsed, consumed) = PsshBox::parse(&data[offset..])?;
            boxes.push(parsed);
            offset += consumed;
        }
        Ok(boxes)
    }
}

/// Splits a concatenation of boxes into their raw encodings.
pub fn split_boxes(data: &[u8]) -> Result<Vec<Bytes>, PacketError> {
    let mut raw = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (_, consumed) = PsshBox::parse(&data[offset..])?;
        raw.push(Bytes::copy_from_slice(&data[offset..offset + consumed]));
        offset += consumed;
    }
    Ok(raw)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_checked_u32(data: &[u8], offset: usize) -> Result<u32, PacketError> {
    if offset + 4 > data.len() {
        return Err(PacketError::InsufficientData {
            expected: offset + 4,
            actual: data.len(),
        });
    }
    Ok(read_u32(data, offset))
}
