//! Logging collaborator
//!
//! Platform log backends truncate long lines, so messages above a byte
//! threshold are split before they reach the sink: first on newlines, then
//! any line that is still too long into fixed-size chunks. Log consumers
//! reassemble output relying on that order.

use std::fmt::{self, Write as _};
use std::io::{self, Write};

use parking_lot::Mutex;
use tracing::{Event, Level, Subscriber, field::Field};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::Context, layer::SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::CommonError;

/// Byte length above which messages are split.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 800;

/// One line handed to a [`LogSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord<'a> {
    pub level: Level,
    /// Logger channel (the event target)
    pub channel: &'a str,
    pub message: &'a str,
    pub file: &'a str,
    /// Enclosing module path
    pub method: &'a str,
    pub line: u32,
}

/// Destination of leveled text lines.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord<'_>);
}

/// Splits `message` into pieces of at most `max_len` bytes.
///
/// A message that fits is returned whole. Otherwise it is split on `'\n'`
/// and each line longer than `max_len` is cut into `max_len`-byte chunks,
/// moving a cut back to the previous character boundary when it would land
/// inside a UTF-8 sequence.
pub fn split_message(message: &str, max_len: usize) -> Vec<&str> {
    if max_len == 0 || message.len() <= max_len {
        return vec![message];
    }
    let mut parts = Vec::new();
    for line in message.split('\n') {
        let mut rest = line;
        while rest.len() > max_len {
            let mut cut = max_len;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == 0 {
                // A single character wider than the threshold.
                cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
            }
            let (head, tail) = rest.split_at(cut);
            parts.push(head);
            rest = tail;
        }
        parts.push(rest);
    }
    parts
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// A `tracing` layer forwarding split events to a [`LogSink`].
pub struct SplittingLayer<K> {
    sink: K,
    max_len: usize,
}

impl<K: LogSink> SplittingLayer<K> {
    pub fn new(sink: K) -> Self {
        Self::with_threshold(sink, DEFAULT_SPLIT_THRESHOLD)
    }

    pub fn with_threshold(sink: K, max_len: usize) -> Self {
        Self { sink, max_len }
    }
}

impl<S, K> Layer<S> for SplittingLayer<K>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    K: LogSink + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.finish();

        for part in split_message(&message, self.max_len) {
            self.sink.write(&LogRecord {
                level: *meta.level(),
                channel: meta.target(),
                message: part,
                file: meta.file().unwrap_or("<unknown>"),
                method: meta.module_path().unwrap_or("<unknown>"),
                line: meta.line().unwrap_or(0),
            });
        }
    }
}

/// Line-oriented sink over any writer.
pub struct WriterSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl LogSink for WriterSink {
    fn write(&self, record: &LogRecord<'_>) {
        let mut writer = self.writer.lock();
        // A failing log writer has nowhere to report to.
        let _ = writeln!(
            writer,
            "{:>5} {}: {}:{}:{} > {}",
            record.level, record.channel, record.file, record.method, record.line, record.message
        );
    }
}

/// Logging options for the process
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
    /// Route events through the splitting layer with this threshold instead
    /// of the plain formatter
    pub split_threshold: Option<usize>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            split_threshold: None,
        }
    }
}

impl LoggingConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = Some(threshold);
        self
    }
}

/// Installs the global subscriber. Only the process entry point calls this.
pub fn init_logging(config: &LoggingConfig) -> Result<(), CommonError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| CommonError::Logging(e.to_string()))?;

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.split_threshold {
        Some(threshold) => Box::new(SplittingLayer::with_threshold(WriterSink::stderr(), threshold)),
        None if config.json => Box::new(tracing_subscriber::fmt::layer().json().with_writer(io::stderr)),
        None => Box::new(tracing_subscriber::fmt::layer().with_writer(io::stderr)),
    };

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| CommonError::Logging(e.to_string()))
}
