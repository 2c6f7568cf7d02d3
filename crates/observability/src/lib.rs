//! Tracing and logging (shared setup).

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize process-wide logging in the given format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};
