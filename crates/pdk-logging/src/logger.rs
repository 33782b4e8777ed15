//! The masking logger handle.

use pdk_config::SecretMasker;
use std::sync::Arc;

use crate::correlation::current_correlation;
use crate::record::{LogLevel, LogRecord};
use crate::sink::{ConsoleSink, JsonFileSink, LogSink, RollingFileSink};

/// Cheap cloneable handle. One logger per run; components receive it by
/// value instead of reaching for a global.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

struct Inner {
    minimum: LogLevel,
    sinks: Vec<Box<dyn LogSink>>,
    masker: Arc<SecretMasker>,
    redact: bool,
}

pub struct LoggerBuilder {
    minimum: LogLevel,
    sinks: Vec<Box<dyn LogSink>>,
    masker: Arc<SecretMasker>,
    redact: bool,
}

impl LoggerBuilder {
    pub fn new(masker: Arc<SecretMasker>) -> Self {
        Self {
            minimum: LogLevel::Information,
            sinks: Vec::new(),
            masker,
            redact: true,
        }
    }

    pub fn minimum(mut self, minimum: LogLevel) -> Self {
        self.minimum = minimum;
        self
    }

    pub fn console(mut self) -> Self {
        self.sinks.push(Box::new(ConsoleSink::new()));
        self
    }

    pub fn file(mut self, path: impl Into<std::path::PathBuf>, max_bytes: u64, retained: usize) -> Self {
        self.sinks.push(Box::new(RollingFileSink::new(path, max_bytes, retained)));
        self
    }

    pub fn json_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.sinks.push(Box::new(JsonFileSink::new(path)));
        self
    }

    pub fn sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Disable redaction. The built logger announces this loudly.
    pub fn no_redact(mut self) -> Self {
        self.redact = false;
        self
    }

    pub fn build(self) -> Logger {
        let logger = Logger {
            inner: Arc::new(Inner {
                minimum: self.minimum,
                sinks: self.sinks,
                masker: self.masker,
                redact: self.redact,
            }),
        };
        if !logger.inner.redact {
            logger.warning(
                "logger",
                "secret redaction is DISABLED (--no-redact); output may contain raw secrets",
                &[],
            );
        }
        logger
    }
}

impl Logger {
    /// A logger that swallows everything, for tests and dry runs.
    pub fn disabled() -> Self {
        LoggerBuilder::new(Arc::new(SecretMasker::new()))
            .minimum(LogLevel::Error)
            .build()
    }

    pub fn minimum(&self) -> LogLevel {
        self.inner.minimum
    }

    pub fn masker(&self) -> &Arc<SecretMasker> {
        &self.inner.masker
    }

    /// Emit a record. Masking runs over the message and every field value
    /// before dispatch; each sink writes independently.
    pub fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        fields: &[(&str, String)],
    ) {
        self.log_with_error(level, source, message, fields, None);
    }

    pub fn log_with_error(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        fields: &[(&str, String)],
        error: Option<&str>,
    ) {
        if !level.passes(self.inner.minimum) {
            return;
        }
        let mask = |s: &str| -> String {
            if self.inner.redact {
                self.inner.masker.mask(s)
            } else {
                s.to_string()
            }
        };
        let record = LogRecord {
            timestamp: chrono::Utc::now(),
            level,
            correlation: current_correlation().unwrap_or_else(|| "-".to_string()),
            source: source.to_string(),
            message: mask(message),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), mask(v)))
                .collect(),
            error: error.map(mask),
        };
        for sink in &self.inner.sinks {
            sink.write(&record);
        }
    }

    pub fn error(&self, source: &str, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Error, source, message, fields);
    }

    pub fn warning(&self, source: &str, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Warning, source, message, fields);
    }

    pub fn info(&self, source: &str, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Information, source, message, fields);
    }

    pub fn debug(&self, source: &str, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Debug, source, message, fields);
    }

    pub fn trace(&self, source: &str, message: &str, fields: &[(&str, String)]) {
        self.log(LogLevel::Trace, source, message, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Captures records for assertions.
    pub struct MemorySink {
        pub records: Arc<Mutex<Vec<LogRecord>>>,
    }

    impl LogSink for MemorySink {
        fn name(&self) -> &'static str {
            "memory"
        }
        fn write(&self, record: &LogRecord) {
            self.records.lock().push(record.clone());
        }
    }

    fn capture(minimum: LogLevel, redact: bool) -> (Logger, Arc<Mutex<Vec<LogRecord>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let masker = Arc::new(SecretMasker::new());
        masker.register("hunter2-xyz");
        let mut builder = LoggerBuilder::new(masker).minimum(minimum).sink(Box::new(
            MemorySink {
                records: Arc::clone(&records),
            },
        ));
        if !redact {
            builder = builder.no_redact();
        }
        (builder.build(), records)
    }

    #[test]
    fn level_gate_filters_records() {
        let (logger, records) = capture(LogLevel::Warning, true);
        logger.info("t", "hidden", &[]);
        logger.warning("t", "shown", &[]);
        logger.error("t", "also shown", &[]);
        let captured = records.lock();
        assert_eq!(captured.len(), 2);
        assert!(captured.iter().all(|r| r.message != "hidden"));
    }

    #[test]
    fn messages_and_fields_are_masked() {
        let (logger, records) = capture(LogLevel::Information, true);
        logger.info(
            "t",
            "token is hunter2-xyz",
            &[("auth", "hunter2-xyz".to_string())],
        );
        let captured = records.lock();
        assert!(!captured[0].message.contains("hunter2-xyz"));
        assert!(!captured[0].fields[0].1.contains("hunter2-xyz"));
    }

    #[test]
    fn no_redact_emits_loud_warning_and_skips_masking() {
        let (logger, records) = capture(LogLevel::Information, false);
        logger.info("t", "value hunter2-xyz", &[]);
        let captured = records.lock();
        assert!(
            captured
                .iter()
                .any(|r| r.level == LogLevel::Warning && r.message.contains("DISABLED")),
            "the builder must announce --no-redact"
        );
        assert!(captured.iter().any(|r| r.message.contains("hunter2-xyz")));
    }

    #[tokio::test]
    async fn records_carry_the_ambient_correlation() {
        let (logger, records) = capture(LogLevel::Information, true);
        logger.info("t", "outside", &[]);
        let id = crate::correlation::new_correlation_id();
        let expected = id.clone();
        crate::correlation::with_scope(id, async {
            logger.info("t", "inside", &[]);
        })
        .await;
        let captured = records.lock();
        assert_eq!(captured[0].correlation, "-");
        assert_eq!(captured[1].correlation, expected);
    }
}
