//! # Player
//!
//! Orders demuxed packets across streams, decrypts them and hands them to a
//! platform sink, and exposes the player state machine.
//!
//! ## Features
//!
//! - [`PacketSynchronizer`]: per stream FIFOs released in playback time order,
//!   cancellation safe
//! - [`StreamRenderer`]: the packet pushing loop with DRM decryption, sink
//!   reject policies and buffering tracking
//! - [`DemuxDriver`]: runs a demuxer on the blocking pool with backpressure
//! - Data providers for DASH and HLS documents and for progressive files
//! - [`PlayerController`]: `Idle → Prepared → Playing ⇄ Paused` state machine
//!   with state and event channels
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod buffering;
pub mod clock;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod provider;
pub mod renderer;
pub mod sink;
pub mod synchronizer;

pub use buffering::BufferingObserver;
pub use clock::PlaybackClock;
pub use config::{
    PlayerConfig, PlayerConfigBuilder, RendererConfig, SinkRejectPolicy, StarvationPolicy, SynchronizerConfig,
};
pub use controller::{ClipInfo, PlayerController, PlayerEvent, PlayerState};
pub use driver::{DemuxDriver, DriverCommand, DriverSettings, PreparedStreams};
pub use error::{PlayerError, RendererError, SyncError};
pub use provider::{
    ClipDefinition, ClipKind, DataProvider, DataProviderFactory, ManifestDataProvider, PreparedClip,
    ProgressiveDataProvider,
};
pub use renderer::{PushOutcome, StreamRenderer};
pub use sink::{LoggingSink, PlatformSink, SubmitResult};
pub use synchronizer::{PacketSynchronizer, TimelineSegment};
