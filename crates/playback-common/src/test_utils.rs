use std::sync::Arc;

use crate::PlaybackContext;

/// Macro to initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
#[macro_export]
macro_rules! init_test_tracing {
    () => {
        $crate::init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

/// Create a playback context with a default client for tests
#[inline]
pub fn create_test_context() -> Arc<PlaybackContext> {
    Arc::new(PlaybackContext::with_client("test", reqwest::Client::new()))
}

// Re-export the macro
pub use crate::init_test_tracing;
