//! Log levels and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hierarchical levels, `Error` most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Information,
    Debug,
    Trace,
}

impl LogLevel {
    /// Whether a record at this level passes a `minimum` gate.
    /// `minimum = Information` lets Error/Warning/Information through.
    pub fn passes(self, minimum: LogLevel) -> bool {
        self <= minimum
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARN",
            LogLevel::Information => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "info" | "information" => Ok(LogLevel::Information),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One structured record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Correlation id of the ambient scope, or `-` outside any scope.
    pub correlation: String,
    /// Emitting component (`orchestrator`, `step:script`, ...).
    pub source: String,
    pub message: String,
    /// Structured key/value pairs, already stringified and masked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogRecord {
    /// Single-line text rendering shared by the console and file sinks.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} [{:5}] ({}) {}: {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.level.as_str(),
            self.correlation,
            self.source,
            self.message
        );
        for (k, v) in &self.fields {
            out.push_str(&format!(" {k}={v}"));
        }
        if let Some(err) = &self.error {
            out.push_str(&format!(" error={err}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_gate_orders_by_severity() {
        assert!(LogLevel::Error.passes(LogLevel::Warning));
        assert!(LogLevel::Warning.passes(LogLevel::Warning));
        assert!(!LogLevel::Information.passes(LogLevel::Warning));
        assert!(LogLevel::Debug.passes(LogLevel::Trace));
        assert!(!LogLevel::Trace.passes(LogLevel::Debug));
    }

    #[test]
    fn levels_parse_with_aliases() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("Information".parse::<LogLevel>().unwrap(), LogLevel::Information);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn render_includes_fields_and_error() {
        let record = LogRecord {
            timestamp: Utc::now(),
            level: LogLevel::Warning,
            correlation: "pdk-abc".into(),
            source: "orchestrator".into(),
            message: "step failed".into(),
            fields: vec![("exit".into(), "2".into())],
            error: Some("exec failed".into()),
        };
        let line = record.render();
        assert!(line.contains("[WARN "));
        assert!(line.contains("(pdk-abc)"));
        assert!(line.contains("exit=2"));
        assert!(line.contains("error=exec failed"));
    }
}
