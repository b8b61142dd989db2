//! Logging setup shared by the command line tools.
//!
//! The library only emits `tracing` events; binaries decide where they go.

use tracing::Level;

/// Install a formatted subscriber at INFO. `RUST_LOG` overrides the level, e.g.
/// `RUST_LOG=vid2cloud=debug`.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install a formatted subscriber with a custom default level.
///
/// Calling this twice is harmless; the second subscriber is ignored.
pub fn init_logger_with_level(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init();
}
