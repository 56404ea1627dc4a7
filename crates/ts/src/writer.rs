//! Minimal transport stream muxer for PSI tables and PES units.

use std::collections::HashMap;

use crate::{
    PID_PAT, TS_PACKET_SIZE,
    pat::Pat,
    pes::write_timestamp,
    pmt::Pmt,
    psi::build_section,
};

#[derive(Debug, Default)]
pub struct TsWriter {
    continuity: HashMap<u16, u8>,
    out: Vec<u8>,
}

impl TsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_pat(&mut self, pat: &Pat) {
        let section = build_section(
            Pat::TABLE_ID,
            pat.transport_stream_id,
            pat.version_number,
            &pat.body(),
        );
        self.write_section(PID_PAT, &section);
    }

    pub fn write_pmt(&mut self, pmt_pid: u16, pmt: &Pmt) {
        let section = build_section(
            Pmt::TABLE_ID,
            pmt.program_number,
            pmt.version_number,
            &pmt.body(),
        );
        self.write_section(pmt_pid, &section);
    }

    /// Writes one PES unit. Video stream ids use an unbounded packet length.
    pub fn write_pes(
        &mut self,
        pid: u16,
        stream_id: u8,
        pts: Option<u64>,
        dts: Option<u64>,
        random_access: bool,
        payload: &[u8],
    ) {
        let mut optional = Vec::with_capacity(10);
        let flags = match (pts, dts) {
            (Some(pts), Some(dts)) => {
                optional.extend_from_slice(&write_timestamp(0b0011, pts));
                optional.extend_from_slice(&write_timestamp(0b0001, dts));
                0xC0
            }
            (Some(pts), None) => {
                optional.extend_from_slice(&write_timestamp(0b0010, pts));
                0x80
            }
            _ => 0x00,
        };

        let body_len = 3 + optional.len() + payload.len();
        let packet_length = if (0xE0..=0xEF).contains(&stream_id) || body_len > u16::MAX as usize {
            0
        } else {
            body_len as u16
        };

        let mut unit = Vec::with_capacity(6 + body_len);
        unit.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
        unit.extend_from_slice(&packet_length.to_be_bytes());
        unit.extend_from_slice(&[0x84, flags, optional.len() as u8]);
        unit.extend_from_slice(&optional);
        unit.extend_from_slice(payload);
        self.packetize(pid, &unit, random_access, true);
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    fn write_section(&mut self, pid: u16, section: &[u8]) {
        let mut unit = Vec::with_capacity(section.len() + 1);
        unit.push(0);
        unit.extend_from_slice(section);
        self.packetize(pid, &unit, false, false);
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }

    fn packetize(&mut self, pid: u16, data: &[u8], random_access: bool, pad_with_adaptation: bool) {
        let mut offset = 0;
        let mut first = true;
        while first || offset < data.len() {
            let mut packet = [0xFFu8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            packet[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F);
            packet[2] = pid as u8;

            let flagged = first && random_access;
            let remaining = data.len() - offset;
            let mut af_len = if flagged { 2 } else { 0 };
            if pad_with_adaptation && remaining < 184 - af_len {
                af_len = 184 - remaining;
            }

            let cc = self.next_cc(pid);
            packet[3] = (if af_len > 0 { 0x30 } else { 0x10 }) | cc;
            if af_len > 0 {
                packet[4] = (af_len - 1) as u8;
                if af_len >= 2 {
                    packet[5] = if flagged { 0x40 } else { 0x00 };
                }
            }

            let start = 4 + af_len;
            let n = remaining.min(TS_PACKET_SIZE - start);
            packet[start..start + n].copy_from_slice(&data[offset..offset + n]);
            offset += n;
            first = false;
            self.out.extend_from_slice(&packet);
        }
    }
}
