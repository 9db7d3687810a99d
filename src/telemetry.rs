//! Logging initialization (component J).
//!
//! A single leveled, line-oriented sink for the whole process, in place of
//! `original_source/src/logger.py`'s `log(msg, level)` helper. Every
//! component logs through `tracing` instead of calling a shared function.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global tracing subscriber. Call once, at process start.
pub fn init() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();
}
