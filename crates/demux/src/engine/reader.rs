use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::source::PullSource;

/// Position-tracking wrapper shared by the engines.
pub(crate) struct SourceReader {
    source: Box<dyn PullSource>,
    position: u64,
}

impl SourceReader {
    pub(crate) fn new(source: Box<dyn PullSource>) -> Self {
        Self { source, position: 0 }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn size(&self) -> Option<u64> {
        self.source.size()
    }

    pub(crate) fn is_seekable(&self) -> bool {
        self.source.is_seekable()
    }

    /// Reads up to `buf.len()` bytes; 0 means end of input.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.source.read(buf) {
                Ok(n) => {
                    self.position += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Fills `buf` completely. Returns `false` when the input ended before
    /// the first byte, and an error when it ended part way.
    pub(crate) fn read_full(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("input ended {} bytes short", buf.len() - filled),
                ));
            }
            filled += n;
        }
        Ok(true)
    }

    /// Reads exactly `len` bytes.
    pub(crate) fn read_bytes(&mut self, len: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        if len > 0 && !self.read_full(&mut buf)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input ended"));
        }
        Ok(buf.freeze())
    }

    /// Reads everything up to the end of input.
    pub(crate) fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(Bytes::from(out));
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Moves to an absolute position, reading forward when the source cannot
    /// seek.
    pub(crate) fn seek(&mut self, position: u64) -> io::Result<()> {
        if position == self.position {
            return Ok(());
        }
        if self.source.is_seekable() {
            self.source.seek_to(position)?;
            self.position = position;
            return Ok(());
        }
        if position < self.position {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot rewind from {} to {position}", self.position),
            ));
        }
        let mut remaining = position - self.position;
        let mut scratch = [0u8; 8 * 1024];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let n = self.read(&mut scratch[..want])?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input ended while skipping"));
            }
            remaining -= n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySource;

    struct Forward(MemorySource);

    impl Read for Forward {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl PullSource for Forward {}

    #[test]
    fn test_forward_only_seek_skips() {
        let mut reader = SourceReader::new(Box::new(Forward(MemorySource::new(vec![1u8, 2, 3, 4, 5]))));
        reader.seek(3).unwrap();
        assert_eq!(&reader.read_bytes(2).unwrap()[..], &[4, 5]);
        assert!(reader.seek(0).is_err());
        assert_eq!(reader.position(), 5);
    }

    #[test]
    fn test_read_full_reports_truncation() {
        let mut reader = SourceReader::new(Box::new(MemorySource::new(vec![1u8, 2])));
        let mut buf = [0u8; 4];
        assert!(reader.read_full(&mut buf).is_err());
        let mut empty = SourceReader::new(Box::new(MemorySource::new(Vec::<u8>::new())));
        assert!(!empty.read_full(&mut buf).unwrap());
    }
}
