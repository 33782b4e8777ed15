//! Structured logging for PDK runs.
//!
//! Not a process-wide static: a [`Logger`] is a cheap cloneable handle
//! constructed once per run and passed to whoever needs it. Every record
//! passes through the secret masker before any sink sees it. Sinks are
//! independent; a failing sink never takes down the others.

pub mod correlation;
pub mod logger;
pub mod record;
pub mod sink;

pub use correlation::{current_correlation, new_correlation_id, with_scope};
pub use logger::{Logger, LoggerBuilder};
pub use record::{LogLevel, LogRecord};
pub use sink::{ConsoleSink, JsonFileSink, LogSink, RollingFileSink};
