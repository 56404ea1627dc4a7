use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use memchr::memchr;

use crate::{
    PID_NULL, PID_PAT, SYNC_BYTE, TS_PACKET_SIZE,
    packet::TsPacket,
    pat::Pat,
    pes::PesHeader,
    pmt::Pmt,
    psi::section_total_len,
};

/// One reassembled PES payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsFrame {
    pub pid: u16,
    /// Presentation timestamp, 90 kHz
    pub pts: Option<u64>,
    /// Decode timestamp, 90 kHz (falls back to the PTS)
    pub dts: Option<u64>,
    pub random_access: bool,
    pub data: Bytes,
    /// Byte offset of the transport packet that started this unit
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsEvent {
    /// A new or updated program map
    Program(Pmt),
    Frame(EsFrame),
}

/// Counters for data the demuxer had to discard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsStats {
    pub packets: u64,
    pub resyncs: u64,
    pub invalid_packets: u64,
    pub invalid_sections: u64,
    pub dropped_units: u64,
}

#[derive(Debug)]
struct PesAssembler {
    offset: u64,
    random_access: bool,
    data: BytesMut,
}

impl PesAssembler {
    fn declared_len(&self) -> Option<usize> {
        if self.data.len() < 6 {
            return None;
        }
        match u16::from_be_bytes([self.data[4], self.data[5]]) {
            0 => None,
            len => Some(6 + len as usize),
        }
    }
}

/// Incremental transport stream demuxer.
///
/// Bytes are pushed with [`feed`](Self::feed); program updates and completed
/// elementary stream frames are pulled with [`next_event`](Self::next_event).
/// Only the first program of the PAT is followed.
#[derive(Debug, Default)]
pub struct TsDemuxer {
    pending: BytesMut,
    position: u64,
    pmt_pid: Option<u16>,
    pmt: Option<Pmt>,
    sections: HashMap<u16, BytesMut>,
    pes: HashMap<u16, PesAssembler>,
    events: VecDeque<TsEvent>,
    stats: TsStats,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pmt(&self) -> Option<&Pmt> {
        self.pmt.as_ref()
    }

    pub fn stats(&self) -> TsStats {
        self.stats
    }

    /// Absolute offset of the next byte expected by [`feed`](Self::feed).
    pub fn position(&self) -> u64 {
        self.position + self.pending.len() as u64
    }

    pub fn next_event(&mut self) -> Option<TsEvent> {
        self.events.pop_front()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while self.pending.len() >= TS_PACKET_SIZE {
            let aligned = self.pending[0] == SYNC_BYTE
                && (self.pending.len() == TS_PACKET_SIZE
                    || self.pending[TS_PACKET_SIZE] == SYNC_BYTE);
            if !aligned {
                let skip = memchr(SYNC_BYTE, &self.pending[1..])
                    .map(|i| i + 1)
                    .unwrap_or(self.pending.len());
                let _ = self.pending.split_to(skip);
                self.position += skip as u64;
                self.stats.resyncs += 1;
                continue;
            }

            let offset = self.position;
            let chunk = self.pending.split_to(TS_PACKET_SIZE).freeze();
            self.position += TS_PACKET_SIZE as u64;
            match TsPacket::parse(chunk) {
                Ok(packet) => self.process_packet(packet, offset),
                Err(_) => self.stats.invalid_packets += 1,
            }
        }
    }

    /// Completes every partially assembled unit; call at end of input.
    pub fn flush(&mut self) {
        let mut open: Vec<(u16, PesAssembler)> = self.pes.drain().collect();
        open.sort_by_key(|(_, assembler)| assembler.offset);
        for (pid, assembler) in open {
            self.finish_unit(pid, assembler);
        }
    }

    /// Drops partial state and queued frames so reading can restart at
    /// `position`. Program information is kept.
    pub fn reset(&mut self, position: u64) {
        self.pending.clear();
        self.sections.clear();
        self.pes.clear();
        self.events.clear();
        self.position = position;
    }

    fn process_packet(&mut self, packet: TsPacket, offset: u64) {
        self.stats.packets += 1;
        if packet.transport_error || packet.pid == PID_NULL {
            return;
        }
        if packet.pid == PID_PAT || Some(packet.pid) == self.pmt_pid {
            self.on_section_data(&packet);
        } else if self
            .pmt
            .as_ref()
            .is_some_and(|pmt| pmt.stream(packet.pid).is_some())
        {
            self.on_pes_data(packet, offset);
        }
    }

    fn on_section_data(&mut self, packet: &TsPacket) {
        let pid = packet.pid;
        if packet.payload_unit_start {
            let Some(payload) = packet.psi_payload() else {
                return;
            };
            self.sections.insert(pid, BytesMut::from(&payload[..]));
        } else if let Some(buffer) = self.sections.get_mut(&pid) {
            buffer.extend_from_slice(&packet.payload);
        } else {
            return;
        }

        let Some(buffer) = self.sections.get_mut(&pid) else {
            return;
        };
        let Some(total) = section_total_len(buffer) else {
            return;
        };
        if buffer.len() < total {
            return;
        }
        let section = buffer.split_to(total).freeze();
        self.sections.remove(&pid);

        if pid == PID_PAT {
            match Pat::parse(&section) {
                Ok(pat) => self.pmt_pid = pat.first_program_pid(),
                Err(_) => self.stats.invalid_sections += 1,
            }
            return;
        }

        match Pmt::parse(&section) {
            Ok(pmt) => {
                let changed = self
                    .pmt
                    .as_ref()
                    .is_none_or(|current| current.version_number != pmt.version_number);
                if changed {
                    self.pmt = Some(pmt.clone());
                    self.events.push_back(TsEvent::Program(pmt));
                }
            }
            Err(_) => self.stats.invalid_sections += 1,
        }
    }

    fn on_pes_data(&mut self, packet: TsPacket, offset: u64) {
        let pid = packet.pid;
        if packet.payload_unit_start {
            if let Some(previous) = self.pes.remove(&pid) {
                self.finish_unit(pid, previous);
            }
            self.pes.insert(
                pid,
                PesAssembler {
                    offset,
                    random_access: packet.random_access(),
                    data: BytesMut::from(&packet.payload[..]),
                },
            );
        } else if let Some(assembler) = self.pes.get_mut(&pid) {
            assembler.data.extend_from_slice(&packet.payload);
        } else {
            return;
        }

        let complete = self
            .pes
            .get(&pid)
            .and_then(|a| a.declared_len().map(|len| a.data.len() >= len))
            .unwrap_or(false);
        if complete && let Some(assembler) = self.pes.remove(&pid) {
            self.finish_unit(pid, assembler);
        }
    }

    fn finish_unit(&mut self, pid: u16, assembler: PesAssembler) {
        let header = match PesHeader::parse(&assembler.data) {
            Ok(header) => header,
            Err(_) => {
                self.stats.dropped_units += 1;
                return;
            }
        };
        let data = assembler.data.freeze();
        let end = match header.packet_length {
            0 => data.len(),
            len => (6 + len as usize).min(data.len()),
        };
        if header.payload_offset > end {
            self.stats.dropped_units += 1;
            return;
        }
        self.events.push_back(TsEvent::Frame(EsFrame {
            pid,
            pts: header.pts,
            dts: header.dts.or(header.pts),
            random_access: assembler.random_access,
            data: data.slice(header.payload_offset..end),
            offset: assembler.offset,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PatProgram, PmtStream, StreamType, TsWriter};

    const PMT_PID: u16 = 0x1000;
    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x101;

    fn program_header(writer: &mut TsWriter) {
        writer.write_pat(&Pat {
            transport_stream_id: 1,
            version_number: 0,
            programs: vec![PatProgram {
                program_number: 1,
                pmt_pid: PMT_PID,
            }],
        });
        writer.write_pmt(
            PMT_PID,
            &Pmt {
                program_number: 1,
                version_number: 0,
                pcr_pid: VIDEO_PID,
                streams: vec![
                    PmtStream::new(StreamType::H264, VIDEO_PID),
                    PmtStream::new(StreamType::AdtsAac, AUDIO_PID),
                ],
            },
        );
    }

    fn drain(demuxer: &mut TsDemuxer) -> Vec<TsEvent> {
        std::iter::from_fn(|| demuxer.next_event()).collect()
    }

    #[test]
    fn test_program_then_frames() {
        let mut writer = TsWriter::new();
        program_header(&mut writer);
        let video_payload = vec![0x11u8; 400];
        writer.write_pes(VIDEO_PID, 0xE0, Some(9000), Some(6000), true, &video_payload);
        writer.write_pes(AUDIO_PID, 0xC0, Some(9000), None, false, b"adts");
        writer.write_pes(VIDEO_PID, 0xE0, Some(12600), None, false, b"next");

        let mut demuxer = TsDemuxer::new();
        demuxer.feed(&writer.into_bytes());
        let events = drain(&mut demuxer);

        assert!(matches!(&events[0], TsEvent::Program(pmt) if pmt.streams.len() == 2));
        // Audio has a bounded length and completes first; the first video unit
        // completes when the next one starts.
        let TsEvent::Frame(audio) = &events[1] else {
            panic!("expected audio frame");
        };
        assert_eq!(audio.pid, AUDIO_PID);
        assert_eq!(&audio.data[..], b"adts");
        assert_eq!(audio.dts, Some(9000));

        let TsEvent::Frame(video) = &events[2] else {
            panic!("expected video frame");
        };
        assert_eq!(video.pid, VIDEO_PID);
        assert_eq!(video.data.len(), 400);
        assert_eq!(video.pts, Some(9000));
        assert_eq!(video.dts, Some(6000));
        assert!(video.random_access);
        assert_eq!(video.offset, 2 * TS_PACKET_SIZE as u64);

        assert_eq!(events.len(), 3);
        demuxer.flush();
        let rest = drain(&mut demuxer);
        assert!(matches!(&rest[0], TsEvent::Frame(f) if &f.data[..] == b"next"));
    }

    #[test]
    fn test_split_feed_and_resync() {
        let mut writer = TsWriter::new();
        program_header(&mut writer);
        writer.write_pes(AUDIO_PID, 0xC0, Some(1), None, false, b"one");
        let bytes = writer.into_bytes();

        let mut demuxer = TsDemuxer::new();
        demuxer.feed(&[0x00, 0x12, 0x34]);
        for chunk in bytes.chunks(50) {
            demuxer.feed(chunk);
        }
        let events = drain(&mut demuxer);
        assert_eq!(events.len(), 2);
        assert!(demuxer.stats().resyncs >= 1);
        assert_eq!(demuxer.position(), bytes.len() as u64 + 3);
    }

    #[test]
    fn test_reset_discards_partial_units() {
        let mut writer = TsWriter::new();
        program_header(&mut writer);
        writer.write_pes(VIDEO_PID, 0xE0, Some(0), None, true, &[0u8; 300]);
        let bytes = writer.into_bytes();

        let mut demuxer = TsDemuxer::new();
        demuxer.feed(&bytes);
        demuxer.reset(0);
        demuxer.flush();
        assert!(drain(&mut demuxer).is_empty());
        assert!(demuxer.pmt().is_some());
    }
}
