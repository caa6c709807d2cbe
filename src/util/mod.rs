//! Utility module
//!
//! Logging setup shared by binaries and tests.

use tracing::Level;

/// Installs a `tracing_subscriber::fmt` subscriber at `level`
///
/// Returns false if a global subscriber was already installed, so calling
/// it twice is harmless.
pub fn init_logging(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}
