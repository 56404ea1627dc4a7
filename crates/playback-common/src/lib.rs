//! # Playback Common
//!
//! Shared building blocks for the playback pipeline crates.
//!
//! ## Features
//!
//! - [`PlaybackContext`]: the explicitly passed-down context (name, statistics,
//!   metadata and the shared HTTP client)
//! - HTTP client factory driven by [`HttpConfig`]
//! - Logging collaborator: a `tracing` layer that splits long messages before
//!   handing them to a [`LogSink`]
//! - Test helpers (`init_test_tracing!`)
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

use thiserror::Error;

pub mod context;
pub mod http;
pub mod logging;
pub mod test_utils;

pub use context::{PlaybackContext, Statistics};
pub use http::{HttpConfig, HttpConfigBuilder, create_client};
pub use logging::{
    DEFAULT_SPLIT_THRESHOLD, LogRecord, LogSink, LoggingConfig, SplittingLayer, WriterSink,
    init_logging, split_message,
};
pub use test_utils::create_test_context;

/// Errors raised while setting up shared infrastructure
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}
