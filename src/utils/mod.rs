//! Utility functions and helpers

pub mod fs;

pub use fs::atomic_write;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Embedding binaries call this once at startup; `RUST_LOG` controls
/// the filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
