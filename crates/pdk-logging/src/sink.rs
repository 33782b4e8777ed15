//! Log sinks: console, rotating file, JSON-lines file.
//!
//! Sinks never propagate their own failures; a sink that cannot write
//! marks itself broken, complains once on stderr, and stays quiet.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::record::{LogLevel, LogRecord};

pub trait LogSink: Send + Sync {
    fn name(&self) -> &'static str;
    /// Write one already-masked record. Must not panic or block on
    /// failure.
    fn write(&self, record: &LogRecord);
}

/// Writes to stdout, colorized unless `NO_COLOR` is set or stdout is not
/// a terminal.
pub struct ConsoleSink {
    color: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        let color = std::env::var_os("NO_COLOR").is_none()
            && console::Term::stdout().features().colors_supported();
        Self { color }
    }

    pub fn with_color(color: bool) -> Self {
        Self { color }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn write(&self, record: &LogRecord) {
        let line = record.render();
        let line = if self.color {
            match record.level {
                LogLevel::Error => console::style(line).red().to_string(),
                LogLevel::Warning => console::style(line).yellow().to_string(),
                LogLevel::Debug | LogLevel::Trace => console::style(line).dim().to_string(),
                LogLevel::Information => line,
            }
        } else {
            line
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

/// Plain-text file sink with size-based rotation.
///
/// When the active file exceeds `max_bytes` it is renamed to `<path>.1`
/// (shifting older generations up) and a fresh file is started. At most
/// `retained` rotated generations are kept.
pub struct RollingFileSink {
    path: PathBuf,
    max_bytes: u64,
    retained: usize,
    state: Mutex<Option<FileState>>,
    broken: AtomicBool,
}

struct FileState {
    file: File,
    written: u64,
}

impl RollingFileSink {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, retained: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            retained,
            state: Mutex::new(None),
            broken: AtomicBool::new(false),
        }
    }

    fn open(path: &Path) -> std::io::Result<FileState> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(FileState { file, written })
    }

    fn rotate(&self) -> std::io::Result<FileState> {
        let generation = |n: usize| PathBuf::from(format!("{}.{n}", self.path.display()));
        // Shift path.N -> path.N+1, oldest dropped.
        for n in (1..self.retained).rev() {
            let from = generation(n);
            if from.exists() {
                let _ = std::fs::rename(&from, generation(n + 1));
            }
        }
        if self.retained > 0 {
            let _ = std::fs::rename(&self.path, generation(1));
        } else {
            let _ = std::fs::remove_file(&self.path);
        }
        Self::open(&self.path)
    }

    fn try_write(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.state.lock();
        if guard.is_none() {
            *guard = Some(Self::open(&self.path)?);
        }
        let state = guard.as_mut().expect("state populated above");
        if state.written + line.len() as u64 + 1 > self.max_bytes && state.written > 0 {
            *state = self.rotate()?;
        }
        writeln!(state.file, "{line}")?;
        state.written += line.len() as u64 + 1;
        Ok(())
    }
}

impl LogSink for RollingFileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write(&self, record: &LogRecord) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.try_write(&record.render()) {
            self.broken.store(true, Ordering::Relaxed);
            eprintln!(
                "pdk: log file sink {} disabled: {e}",
                self.path.display()
            );
        }
    }
}

/// JSON-lines structured sink; one serialized record per line.
pub struct JsonFileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
    broken: AtomicBool,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
            broken: AtomicBool::new(false),
        }
    }

    fn try_write(&self, record: &LogRecord) -> std::io::Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let file = guard.as_mut().expect("file opened above");
        let json = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{json}")
    }
}

impl LogSink for JsonFileSink {
    fn name(&self) -> &'static str {
        "json"
    }

    fn write(&self, record: &LogRecord) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.try_write(record) {
            self.broken.store(true, Ordering::Relaxed);
            eprintln!("pdk: json sink {} disabled: {e}", self.path.display());
        }
    }
}
