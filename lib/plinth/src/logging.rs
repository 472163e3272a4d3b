//! Thin facade over `slog`/`sloggers` so the rest of the workspace only ever
//! imports `plinth::logging`.

pub use slog::{b, crit, debug, error, info, kv, log, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};
pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::SourceLocation;
use sloggers::Build;

/// Builds the root terminal logger at the requested severity.
pub fn init(level: Severity) -> sloggers::Result<Logger> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.source_location(SourceLocation::None);
    builder.build()
}

/// A logger that swallows everything. Used when logging is configured off and
/// as the default in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
