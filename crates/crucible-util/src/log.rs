//! Root logger construction, done once per binary in `main`.

use crate::config::LogLevel;
use slog::{o, Drain as _, Logger};

/// Build a terminal logger at `level`, run `body` with it, and flush the
/// async drain before returning.
pub fn with_logger<T>(level: LogLevel, body: impl FnOnce(Logger) -> T) -> T {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.as_slog_level()).fuse();
    let log = Logger::root(drain, o!());
    body(log)
}

/// A logger that swallows everything. For tests.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
