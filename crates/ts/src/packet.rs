use bytes::Bytes;

use crate::{Result, TsError};

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

/// Decoded adaptation field flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptationField {
    pub discontinuity: bool,
    pub random_access: bool,
    /// Program clock reference base (90 kHz)
    pub pcr: Option<u64>,
}

impl AdaptationField {
    fn parse(data: &[u8]) -> Self {
        let Some(&flags) = data.first() else {
            return Self::default();
        };
        let pcr = if flags & 0x10 != 0 && data.len() >= 7 {
            Some(
                (data[1] as u64) << 25
                    | (data[2] as u64) << 17
                    | (data[3] as u64) << 9
                    | (data[4] as u64) << 1
                    | (data[5] as u64) >> 7,
            )
        } else {
            None
        };
        Self {
            discontinuity: flags & 0x80 != 0,
            random_access: flags & 0x40 != 0,
            pcr,
        }
    }
}

/// One transport packet. The payload shares the caller's buffer.
#[derive(Debug, Clone)]
pub struct TsPacket {
    pub pid: u16,
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub scrambling_control: u8,
    pub continuity_counter: u8,
    pub adaptation: Option<AdaptationField>,
    pub payload: Bytes,
}

impl TsPacket {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() != TS_PACKET_SIZE {
            return Err(TsError::InvalidPacketSize(data.len()));
        }
        if data[0] != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(data[0]));
        }

        let pid = ((data[1] as u16 & 0x1F) << 8) | data[2] as u16;
        let adaptation_field_control = (data[3] >> 4) & 0x03;

        let mut offset = 4;
        let mut adaptation = None;
        if adaptation_field_control & 0x02 != 0 {
            let length = data[offset] as usize;
            offset += 1;
            if offset + length > TS_PACKET_SIZE {
                return Err(TsError::InsufficientData {
                    expected: offset + length,
                    actual: TS_PACKET_SIZE,
                });
            }
            adaptation = Some(AdaptationField::parse(&data[offset..offset + length]));
            offset += length;
        }

        let payload = if adaptation_field_control & 0x01 != 0 {
            data.slice(offset..)
        } else {
            Bytes::new()
        };

        Ok(TsPacket {
            pid,
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            scrambling_control: (data[3] >> 6) & 0x03,
            continuity_counter: data[3] & 0x0F,
            adaptation,
            payload,
        })
    }

    pub fn random_access(&self) -> bool {
        self.adaptation.is_some_and(|af| af.random_access)
    }

    /// PSI payload with the pointer field skipped on unit start packets.
    pub fn psi_payload(&self) -> Option<Bytes> {
        if !self.payload_unit_start {
            return Some(self.payload.clone());
        }
        let pointer = *self.payload.first()? as usize;
        if 1 + pointer >= self.payload.len() {
            return None;
        }
        Some(self.payload.slice(1 + pointer..))
    }
}
