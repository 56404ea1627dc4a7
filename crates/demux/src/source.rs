//! Byte sources pulled by container engines.
//!
//! Engines read synchronously. Network data arrives through a
//! [`SharedBuffer`]: an async producer appends downloaded bytes while the
//! engine, on a blocking thread, reads through a [`SharedBufferReader`] that
//! waits for more data instead of reporting a premature end of input.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

/// A readable input, optionally seekable.
pub trait PullSource: Read + Send {
    /// Total length when known in advance.
    fn size(&self) -> Option<u64> {
        None
    }

    fn is_seekable(&self) -> bool {
        false
    }

    /// Moves the read position to an absolute offset.
    fn seek_to(&mut self, _position: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "source is not seekable"))
    }
}

/// Input handed to an engine.
pub enum DataSource {
    Pull(Box<dyn PullSource>),
    /// Local path or `file://` URL
    Url(String),
}

impl DataSource {
    pub fn pull(source: impl PullSource + 'static) -> Self {
        DataSource::Pull(Box::new(source))
    }

    /// Resolves the source into something an engine can read.
    pub fn into_pull(self) -> io::Result<Box<dyn PullSource>> {
        match self {
            DataSource::Pull(source) => Ok(source),
            DataSource::Url(url) => {
                let path = url.strip_prefix("file://").unwrap_or(&url);
                if path.contains("://") {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("engine cannot open remote url {url}"),
                    ));
                }
                Ok(Box::new(FileSource::open(path)?))
            }
        }
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Pull(_) => f.write_str("DataSource::Pull(..)"),
            DataSource::Url(url) => write!(f, "DataSource::Url({url})"),
        }
    }
}

/// Fixed in-memory input.
#[derive(Debug, Clone)]
pub struct MemorySource {
    cursor: Cursor<Bytes>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            cursor: Cursor::new(data.into()),
        }
    }
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl PullSource for MemorySource {
    fn size(&self) -> Option<u64> {
        Some(self.cursor.get_ref().len() as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.cursor.set_position(position);
        Ok(())
    }
}

/// Local file input.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl PullSource for FileSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(position)).map(|_| ())
    }
}

#[derive(Debug, Default)]
struct BufferState {
    data: BytesMut,
    /// Absolute offset of `data[0]`
    base: u64,
    /// Absolute offset of the reader
    read_position: u64,
    finished: bool,
    closed: bool,
}

impl BufferState {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BufferState>,
    changed: Condvar,
    /// Bytes kept behind the reader; `None` keeps everything
    retention: Option<usize>,
}

/// Growable buffer filled by a producer and drained by one blocking reader.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    shared: Arc<Shared>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `bytes` of already-read data, so seeking back is
    /// limited to that window. Meant for unbounded live input.
    pub fn with_retention(bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                retention: Some(bytes),
                ..Shared::default()
            }),
        }
    }

    /// Appends data. Returns `false` once the buffer is closed.
    pub fn write(&self, data: &[u8]) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.data.extend_from_slice(data);
        drop(state);
        self.shared.changed.notify_all();
        true
    }

    /// Marks the end of input; readers drain what is left and then see EOF.
    pub fn finish(&self) {
        self.shared.state.lock().finished = true;
        self.shared.changed.notify_all();
    }

    /// Aborts the buffer: blocked and future reads fail, writes are refused.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().finished
    }

    /// Total bytes written so far.
    pub fn len(&self) -> u64 {
        self.shared.state.lock().end()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes written but not yet read.
    pub fn unread_len(&self) -> u64 {
        let state = self.shared.state.lock();
        state.end().saturating_sub(state.read_position)
    }

    pub fn reader(&self) -> SharedBufferReader {
        SharedBufferReader {
            shared: self.shared.clone(),
            position: self.shared.state.lock().read_position,
        }
    }
}

/// Blocking reader over a [`SharedBuffer`]. Dropping it closes the buffer so
/// the producer stops.
#[derive(Debug)]
pub struct SharedBufferReader {
    shared: Arc<Shared>,
    position: u64,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "shared buffer closed")
}

impl Read for SharedBufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(closed_error());
            }
            if self.position < state.end() {
                break;
            }
            if state.finished {
                return Ok(0);
            }
            self.shared.changed.wait(&mut state);
        }

        let start = (self.position - state.base) as usize;
        let n = buf.len().min(state.data.len() - start);
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        self.position += n as u64;
        state.read_position = self.position;

        if let Some(retention) = self.shared.retention {
            let behind = (self.position - state.base) as usize;
            if behind > retention * 2 {
                let drop_len = behind - retention;
                let _ = state.data.split_to(drop_len);
                state.base += drop_len as u64;
            }
        }
        Ok(n)
    }
}

impl PullSource for SharedBufferReader {
    fn size(&self) -> Option<u64> {
        let state = self.shared.state.lock();
        state.finished.then(|| state.end())
    }

    fn is_seekable(&self) -> bool {
        true
    }

    /// Seeks within retained data. A position past the written data waits
    /// until it arrives; past the end of finished input it is an error.
    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if position < state.base {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("position {position} was released (window starts at {})", state.base),
            ));
        }
        loop {
            if state.closed {
                return Err(closed_error());
            }
            if position <= state.end() {
                break;
            }
            if state.finished {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("position {position} is past the end ({})", state.end()),
                ));
            }
            self.shared.changed.wait(&mut state);
        }
        self.position = position;
        state.read_position = position;
        Ok(())
    }
}

impl Drop for SharedBufferReader {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.changed.notify_all();
    }
}
