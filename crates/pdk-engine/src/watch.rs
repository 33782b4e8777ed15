//! The watch loop.
//!
//! A filesystem watcher over the pipeline definition and the repository
//! tree feeds a debounced trigger: a burst of events collapses into one
//! run once the quiet window elapses. Exactly one run executes at a
//! time; events arriving mid-run queue up for at most one follow-up run.
//! A run failure never stops the watch; cancellation drains gracefully
//! and reports a summary.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pdk_core::cancel::CancelToken;
use pdk_core::error::{Error, Result};

/// Directories never worth re-running for.
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", ".pdk", ".pdk-tmp", "target"];

/// Extensions of build outputs and other binaries.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "o", "a", "bin", "pdb", "class", "pyc", "log",
];

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Watched roots: the pipeline file plus the repository tree.
    pub roots: Vec<PathBuf>,
    pub debounce: Duration,
    /// User-configured exclude fragments, matched against path components.
    pub extra_excludes: Vec<String>,
}

impl WatchOptions {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            debounce: DEFAULT_DEBOUNCE,
            extra_excludes: Vec::new(),
        }
    }
}

/// End-of-watch accounting, printed on Ctrl-C.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub runs: usize,
    pub successes: usize,
    pub failures: usize,
    pub wall_time: Duration,
}

/// Should a change to this path trigger a run?
pub fn is_relevant(path: &Path, extra_excludes: &[String]) -> bool {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if EXCLUDED_DIRS.contains(&name.as_ref()) {
            return false;
        }
        if extra_excludes.iter().any(|x| name.as_ref() == x.as_str()) {
            return false;
        }
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if EXCLUDED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return false;
        }
    }
    true
}

/// Run `execute` once per debounced batch of file changes until the
/// cancel token fires. `execute` receives the batched paths and returns
/// whether the run succeeded.
pub async fn watch_loop<F, Fut>(
    options: WatchOptions,
    cancel: CancelToken,
    mut execute: F,
) -> Result<WatchSummary>
where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel::<Vec<PathBuf>>(256);

    let mut watcher = create_watcher(tx)?;
    for root in &options.roots {
        let mode = if root.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(e) = watcher.watch(root, mode) {
            // Transient errors (permission, missing path) are logged and
            // the remaining roots still watch.
            warn!(root = %root.display(), error = %e, "watch failed for root");
        }
    }

    let mut summary = WatchSummary::default();
    let mut batch: Vec<PathBuf> = Vec::new();
    let mut quiet_since: Option<Instant> = None;

    loop {
        let deadline = quiet_since.map(|t| t + options.debounce);
        tokio::select! {
            changed = rx.recv() => {
                let Some(paths) = changed else { break };
                let relevant: Vec<PathBuf> = paths
                    .into_iter()
                    .filter(|p| is_relevant(p, &options.extra_excludes))
                    .collect();
                if !relevant.is_empty() {
                    debug!(count = relevant.len(), "file events");
                    batch.extend(relevant);
                    quiet_since = Some(Instant::now());
                }
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                let paths = std::mem::take(&mut batch);
                quiet_since = None;
                if paths.is_empty() {
                    continue;
                }
                summary.runs += 1;
                if execute(dedup(paths)).await {
                    summary.successes += 1;
                } else {
                    summary.failures += 1;
                }
                // Events that arrived during the run are already queued
                // in the channel; the next loop turn picks them up and
                // schedules the single pending follow-up.
            }
            _ = cancel.cancelled() => {
                debug!("watch cancelled, draining");
                break;
            }
        }
    }

    summary.wall_time = started.elapsed();
    Ok(summary)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
        }
        None => futures::future::pending().await,
    }
}

fn create_watcher(tx: mpsc::Sender<Vec<PathBuf>>) -> Result<RecommendedWatcher> {
    notify::recommended_watcher(move |result: std::result::Result<notify::Event, notify::Error>| {
        match result {
            Ok(event) => {
                use notify::EventKind;
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && !event.paths.is_empty()
                {
                    let _ = tx.blocking_send(event.paths);
                }
            }
            Err(e) => {
                // Filesystem errors are logged and retried on the next event.
                warn!(error = %e, "watch event error");
            }
        }
    })
    .map_err(|e| Error::Internal(format!("file watcher init failed: {e}")))
}

fn dedup(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}
