//! Core functionality for the Procyon process subsystem
//!
//! This crate spawns external executables, exchanges bytes with them over
//! their standard streams, and delivers incoming output either through
//! blocking reads or asynchronously via a background pump. Teardown is
//! deterministic: shutdown is requested, pump threads are joined, and only
//! then is the native handle released.

pub mod command;
pub mod config;
pub mod error;
pub mod process;


// Re-export schema types for convenience
pub use schema::*;

pub use error::{CoreError, Result};
pub use process::{NativeHandle, OutputSink, Process, PumpHandle};

/// Core utilities and helper functions
pub mod utils {
    use std::sync::Once;
    use tracing::info;

    static INIT_TRACING: Once = Once::new();

    /// Initialize tracing for the application
    ///
    /// Safe to call more than once; only the first call installs the
    /// subscriber, later calls are no-ops.
    pub fn init_tracing(level: &str) {
        use tracing_subscriber::{fmt, EnvFilter};

        INIT_TRACING.call_once(|| {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

            if fmt().with_env_filter(filter).try_init().is_ok() {
                info!("Tracing initialized with level: {}", level);
            }
        });
    }
}
