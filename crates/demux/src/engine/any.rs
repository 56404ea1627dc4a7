use std::io::{self, Read};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tracing::debug;

use super::{ContainerEngine, EngineFrame, EngineStream, Mp4Engine, TsEngine};
use crate::{DemuxerConfig, DemuxerError, Result, source::{DataSource, PullSource}};

const PROBE_LEN: usize = 4096;
const TS_PACKET: usize = 188;

const MP4_BOX_TYPES: [&[u8; 4]; 13] = [
    b"ftyp", b"styp", b"moov", b"moof", b"free", b"skip", b"mdat", b"sidx", b"wide", b"pdin",
    b"uuid", b"emsg", b"prft",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    MpegTs,
    Mp4,
}

fn probe(data: &[u8]) -> Option<Format> {
    if data.len() >= 8 && MP4_BOX_TYPES.iter().any(|t| &data[4..8] == *t) {
        return Some(Format::Mp4);
    }
    if !data.is_empty() && data[0] == 0x47 {
        let packets = data.len().div_ceil(TS_PACKET).min(4);
        let synced = (0..packets)
            .map(|i| i * TS_PACKET)
            .take_while(|&pos| pos < data.len())
            .all(|pos| data[pos] == 0x47);
        if synced {
            return Some(Format::MpegTs);
        }
    }
    None
}

/// Replays probed bytes in front of a non-seekable source.
struct PrefixedSource {
    prefix: Bytes,
    inner: Box<dyn PullSource>,
}

impl Read for PrefixedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.prefix.has_remaining() {
            let n = buf.len().min(self.prefix.remaining());
            self.prefix.copy_to_slice(&mut buf[..n]);
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

impl PullSource for PrefixedSource {
    fn size(&self) -> Option<u64> {
        self.inner.size()
    }
}

enum Inner {
    None,
    Ts(TsEngine),
    Mp4(Mp4Engine),
}

/// Engine that detects the container from the first bytes of input.
pub struct AnyEngine {
    inner: Inner,
}

impl Default for AnyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AnyEngine {
    pub fn new() -> Self {
        Self { inner: Inner::None }
    }

    fn engine(&self) -> Result<&dyn ContainerEngine> {
        match &self.inner {
            Inner::None => Err(DemuxerError::NotOpen),
            Inner::Ts(e) => Ok(e),
            Inner::Mp4(e) => Ok(e),
        }
    }

    fn engine_mut(&mut self) -> Result<&mut dyn ContainerEngine> {
        match &mut self.inner {
            Inner::None => Err(DemuxerError::NotOpen),
            Inner::Ts(e) => Ok(e),
            Inner::Mp4(e) => Ok(e),
        }
    }
}

impl ContainerEngine for AnyEngine {
    fn name(&self) -> &'static str {
        match &self.inner {
            Inner::None => "any",
            Inner::Ts(e) => e.name(),
            Inner::Mp4(e) => e.name(),
        }
    }

    fn open_input(&mut self, source: DataSource, config: &DemuxerConfig) -> Result<()> {
        if !matches!(self.inner, Inner::None) {
            return Err(DemuxerError::AlreadyOpen);
        }
        let mut source = source.into_pull()?;

        let mut head = vec![0u8; PROBE_LEN];
        let mut filled = 0;
        while filled < PROBE_LEN {
            match source.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        head.truncate(filled);

        let format = probe(&head).ok_or_else(|| {
            DemuxerError::UnsupportedFormat(format!("unrecognized container ({filled} bytes probed)"))
        })?;
        debug!(?format, probed = filled, "Detected container format");

        let source: Box<dyn PullSource> = if source.is_seekable() {
            source.seek_to(0)?;
            source
        } else {
            Box::new(PrefixedSource {
                prefix: Bytes::from(head),
                inner: source,
            })
        };
        let source = DataSource::Pull(source);

        self.inner = match format {
            Format::MpegTs => {
                let mut engine = TsEngine::new();
                engine.open_input(source, config)?;
                Inner::Ts(engine)
            }
            Format::Mp4 => {
                let mut engine = Mp4Engine::new();
                engine.open_input(source, config)?;
                Inner::Mp4(engine)
            }
        };
        Ok(())
    }

    fn find_stream_info(&mut self) -> Result<()> {
        self.engine_mut()?.find_stream_info()
    }

    fn streams(&self) -> &[EngineStream] {
        match &self.inner {
            Inner::None => &[],
            Inner::Ts(e) => e.streams(),
            Inner::Mp4(e) => e.streams(),
        }
    }

    fn set_discard(&mut self, index: usize, discard: bool) -> Result<()> {
        self.engine_mut()?.set_discard(index, discard)
    }

    fn read_frame(&mut self) -> Result<Option<EngineFrame>> {
        self.engine_mut()?.read_frame()
    }

    fn seek_frame(&mut self, stream_index: usize, timestamp: i64, backward: bool) -> Result<()> {
        self.engine_mut()?.seek_frame(stream_index, timestamp, backward)
    }

    fn duration(&self) -> Option<Duration> {
        self.engine().ok()?.duration()
    }

    fn close(&mut self) {
        if let Ok(engine) = self.engine_mut() {
            engine.close();
        }
    }
}
