//! The artifact staging store.
//!
//! Layout:
//!
//! ```text
//! <root>/run-<runId>/job-<job>/step-<step>/artifact-<name>/
//!     artifact.metadata.json
//!     <files preserving relative paths, or <name>.tar.gz / <name>.zip>
//! ```
//!
//! Writes stage into a temporary directory under the root and are renamed
//! into place, so a crash never leaves a half-written artifact.

use chrono::Utc;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use pdk_core::RunId;
use pdk_core::artifact::{ArtifactDefinition, Compression, ConflictPolicy, IfNoFilesFound};
use pdk_core::error::{Error, Result};

use crate::glob;
use crate::meta::{ArtifactMetadata, FileEntry};

/// Extensions that are already compressed; stored without recompression
/// inside zip archives.
const PRECOMPRESSED_EXT: &[&str] = &[
    "gz", "tgz", "zip", "bz2", "xz", "zst", "7z", "jar", "png", "jpg", "jpeg", "gif", "webp",
    "woff", "woff2", "mp4",
];

/// Identifies who is writing: one (run, job, step) tuple.
#[derive(Debug, Clone)]
pub struct ArtifactScope {
    pub run_id: RunId,
    pub job: String,
    pub step: String,
}

#[derive(Debug)]
pub struct UploadOutcome {
    /// False when the empty-match policy allowed the step to succeed
    /// without storing anything.
    pub stored: bool,
    pub file_count: usize,
    pub total_bytes: u64,
    pub warning: Option<String>,
    pub location: Option<PathBuf>,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub file_count: usize,
    pub target: PathBuf,
    /// Files left untouched by the `Skip` conflict policy.
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct SweepStats {
    pub runs_removed: usize,
    pub bytes_freed: u64,
}

pub struct ArtifactStore {
    root: PathBuf,
    default_retention_days: u32,
    min_free_bytes: u64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, retention_days: u32, min_free_disk_mb: u64) -> Self {
        Self {
            root: root.into(),
            default_retention_days: retention_days,
            min_free_bytes: min_free_disk_mb * 1024 * 1024,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage files matching the definition's patterns out of
    /// `source_root` (the sandbox workspace as seen from the host).
    pub fn upload(
        &self,
        scope: &ArtifactScope,
        def: &ArtifactDefinition,
        source_root: &Path,
    ) -> Result<UploadOutcome> {
        def.validate()?;
        std::fs::create_dir_all(&self.root)?;
        self.check_disk_space()?;

        let matched = glob::select_files(source_root, &def.include, &def.exclude)?;
        if matched.is_empty() {
            return match def.options.if_no_files_found {
                IfNoFilesFound::Error => Err(Error::GlobNoMatch(def.include.join(", "))),
                IfNoFilesFound::Warn => Ok(UploadOutcome {
                    stored: false,
                    file_count: 0,
                    total_bytes: 0,
                    warning: Some(format!(
                        "no files matched '{}'; nothing uploaded",
                        def.include.join(", ")
                    )),
                    location: None,
                }),
                IfNoFilesFound::Ignore => Ok(UploadOutcome {
                    stored: false,
                    file_count: 0,
                    total_bytes: 0,
                    warning: None,
                    location: None,
                }),
            };
        }

        let final_dir = self.artifact_dir(scope, &def.name);
        if final_dir.exists() {
            if !def.options.overwrite {
                return Err(Error::ArtifactExists(def.name.clone()));
            }
            std::fs::remove_dir_all(&final_dir)?;
        }

        // Stage under the root so the final rename stays on one filesystem.
        let staging = self
            .root
            .join(format!(".staging-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&staging)?;

        let result = self.stage(&staging, scope, def, source_root, &matched);
        match result {
            Ok(metadata) => {
                if let Some(parent) = final_dir.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&staging, &final_dir)?;
                debug!(artifact = %def.name, files = metadata.file_count, "artifact stored");
                Ok(UploadOutcome {
                    stored: true,
                    file_count: metadata.file_count,
                    total_bytes: metadata.total_bytes,
                    warning: None,
                    location: Some(final_dir),
                })
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    fn stage(
        &self,
        staging: &Path,
        scope: &ArtifactScope,
        def: &ArtifactDefinition,
        source_root: &Path,
        matched: &[PathBuf],
    ) -> Result<ArtifactMetadata> {
        let mut entries = Vec::with_capacity(matched.len());
        let mut total_bytes = 0u64;

        for relative in matched {
            let source = source_root.join(relative);
            let size = std::fs::metadata(&source)?.len();
            total_bytes += size;
            entries.push(FileEntry {
                source: source.display().to_string(),
                stored: relative.to_string_lossy().replace('\\', "/"),
                size,
                sha256: sha256_file(&source)?,
            });
        }

        match def.options.compression {
            Compression::None => {
                for relative in matched {
                    let dest = staging.join(relative);
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(source_root.join(relative), &dest)?;
                }
            }
            Compression::Gzip => {
                let archive = File::create(staging.join(format!("{}.tar.gz", def.name)))?;
                let encoder = GzEncoder::new(archive, GzLevel::default());
                let mut builder = tar::Builder::new(encoder);
                for relative in matched {
                    builder.append_path_with_name(source_root.join(relative), relative)?;
                }
                builder.into_inner()?.finish()?;
            }
            Compression::Zip => {
                let archive = File::create(staging.join(format!("{}.zip", def.name)))?;
                let mut writer = zip::ZipWriter::new(archive);
                for relative in matched {
                    let name = relative.to_string_lossy().replace('\\', "/");
                    let method = if is_precompressed(relative) {
                        zip::CompressionMethod::Stored
                    } else {
                        zip::CompressionMethod::Deflated
                    };
                    let options = zip::write::SimpleFileOptions::default()
                        .compression_method(method);
                    writer
                        .start_file(name, options)
                        .map_err(|e| Error::Internal(format!("zip write failed: {e}")))?;
                    let mut src = File::open(source_root.join(relative))?;
                    io::copy(&mut src, &mut writer)?;
                }
                writer
                    .finish()
                    .map_err(|e| Error::Internal(format!("zip finish failed: {e}")))?;
            }
        }

        let metadata = ArtifactMetadata {
            name: def.name.clone(),
            uploaded_at: Utc::now(),
            job: scope.job.clone(),
            step: scope.step.clone(),
            file_count: entries.len(),
            total_bytes,
            compression: def.options.compression,
            retention_days: def.options.retention_days,
            files: entries,
        };
        metadata.write_to(staging)?;
        Ok(metadata)
    }

    /// Locate an artifact by name within a run (optionally narrowed to a
    /// job and/or step) and materialize it into `target`. The newest
    /// upload wins when several match.
    pub fn download(
        &self,
        run_id: &RunId,
        name: &str,
        job_filter: Option<&str>,
        step_filter: Option<&str>,
        target: &Path,
        conflict: ConflictPolicy,
    ) -> Result<DownloadOutcome> {
        let (dir, metadata) = self
            .locate(run_id, name, job_filter, step_filter)?
            .ok_or_else(|| Error::ArtifactNotFound(name.to_string()))?;

        std::fs::create_dir_all(target)?;

        // Archives are unpacked to a scratch dir first so the conflict
        // policy applies per file either way.
        let scratch;
        let source: PathBuf = match metadata.compression {
            Compression::None => dir.clone(),
            Compression::Gzip => {
                scratch = tempfile::tempdir_in(&self.root)?;
                let archive = File::open(dir.join(format!("{name}.tar.gz")))
                    .map_err(|_| Error::ArtifactCorrupt(dir.clone()))?;
                tar::Archive::new(GzDecoder::new(archive))
                    .unpack(scratch.path())
                    .map_err(|_| Error::ArtifactCorrupt(dir.clone()))?;
                scratch.path().to_path_buf()
            }
            Compression::Zip => {
                scratch = tempfile::tempdir_in(&self.root)?;
                let archive = File::open(dir.join(format!("{name}.zip")))
                    .map_err(|_| Error::ArtifactCorrupt(dir.clone()))?;
                let mut zip = zip::ZipArchive::new(archive)
                    .map_err(|_| Error::ArtifactCorrupt(dir.clone()))?;
                zip.extract(scratch.path())
                    .map_err(|_| Error::ArtifactCorrupt(dir.clone()))?;
                scratch.path().to_path_buf()
            }
        };

        let mut materialized = 0usize;
        let mut skipped = 0usize;
        for entry in &metadata.files {
            let from = source.join(&entry.stored);
            let to = target.join(&entry.stored);

            if sha256_file(&from)? != entry.sha256 {
                return Err(Error::ArtifactCorrupt(from));
            }

            if to.exists() {
                match conflict {
                    ConflictPolicy::Error => {
                        return Err(Error::InvalidInput(format!(
                            "download target {} already exists",
                            to.display()
                        )));
                    }
                    ConflictPolicy::Skip => {
                        skipped += 1;
                        continue;
                    }
                    ConflictPolicy::Overwrite => {}
                }
            }
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&from, &to)?;
            materialized += 1;
        }

        Ok(DownloadOutcome {
            file_count: materialized,
            target: target.to_path_buf(),
            skipped,
        })
    }

    fn locate(
        &self,
        run_id: &RunId,
        name: &str,
        job_filter: Option<&str>,
        step_filter: Option<&str>,
    ) -> Result<Option<(PathBuf, ArtifactMetadata)>> {
        let run_dir = self.root.join(format!("run-{}", run_id.short()));
        let mut best: Option<(PathBuf, ArtifactMetadata)> = None;

        for dir in artifact_dirs(&run_dir) {
            if dir
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n != format!("artifact-{name}"))
            {
                continue;
            }
            let metadata = match ArtifactMetadata::read_from(&dir) {
                Ok(m) => m,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable artifact");
                    continue;
                }
            };
            if job_filter.is_some_and(|j| metadata.job != j) {
                continue;
            }
            if step_filter.is_some_and(|s| metadata.step != s) {
                continue;
            }
            let newer = best
                .as_ref()
                .is_none_or(|(_, b)| metadata.uploaded_at > b.uploaded_at);
            if newer {
                best = Some((dir, metadata));
            }
        }
        Ok(best)
    }

    /// List metadata for every artifact in a run (or all runs).
    pub fn list(&self, run_id: Option<&RunId>) -> Result<Vec<ArtifactMetadata>> {
        let mut found = Vec::new();
        let run_dirs: Vec<PathBuf> = match run_id {
            Some(id) => vec![self.root.join(format!("run-{}", id.short()))],
            None => read_dirs(&self.root)
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("run-"))
                })
                .collect(),
        };
        for run_dir in run_dirs {
            for dir in artifact_dirs(&run_dir) {
                if let Ok(metadata) = ArtifactMetadata::read_from(&dir) {
                    found.push(metadata);
                }
            }
        }
        found.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(found)
    }

    /// Remove run directories whose artifacts have all expired. Runs at
    /// engine startup and on demand; there is no background task.
    pub fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        for run_dir in read_dirs(&self.root) {
            let name_ok = run_dir
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run-"));
            if !name_ok {
                continue;
            }
            let artifacts: Vec<ArtifactMetadata> = artifact_dirs(&run_dir)
                .filter_map(|d| ArtifactMetadata::read_from(&d).ok())
                .collect();
            if artifacts.is_empty() {
                continue;
            }
            let all_expired = artifacts.iter().all(|m| {
                let retention = if m.retention_days > 0 {
                    m.retention_days
                } else {
                    self.default_retention_days
                };
                if retention == 0 {
                    return false;
                }
                (now - m.uploaded_at).num_days() >= i64::from(retention)
            });
            if all_expired {
                stats.bytes_freed += dir_size(&run_dir);
                std::fs::remove_dir_all(&run_dir)?;
                stats.runs_removed += 1;
            }
        }
        Ok(stats)
    }

    fn artifact_dir(&self, scope: &ArtifactScope, name: &str) -> PathBuf {
        self.root
            .join(format!("run-{}", scope.run_id.short()))
            .join(format!("job-{}", sanitize(&scope.job)))
            .join(format!("step-{}", sanitize(&scope.step)))
            .join(format!("artifact-{name}"))
    }

    fn check_disk_space(&self) -> Result<()> {
        if self.min_free_bytes == 0 {
            return Ok(());
        }
        match fs2::available_space(&self.root) {
            Ok(available) if available < self.min_free_bytes => Err(Error::DiskSpaceLow {
                available,
                floor: self.min_free_bytes,
            }),
            Ok(_) => Ok(()),
            // Probe failures (odd filesystems) are not fatal.
            Err(e) => {
                debug!(error = %e, "disk space probe failed");
                Ok(())
            }
        }
    }
}

/// Directory component from a job or step name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_dirs(dir: &Path) -> impl Iterator<Item = PathBuf> + use<> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>()
        .into_iter()
}

/// All `artifact-*` directories under `run-*/job-*/step-*`.
fn artifact_dirs(run_dir: &Path) -> impl Iterator<Item = PathBuf> + use<> {
    read_dirs(run_dir)
        .flat_map(|job| read_dirs(&job).collect::<Vec<_>>())
        .flat_map(|step| read_dirs(&step).collect::<Vec<_>>())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("artifact-"))
        })
        .collect::<Vec<_>>()
        .into_iter()
}

fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn is_precompressed(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| PRECOMPRESSED_EXT.contains(&e.to_ascii_lowercase().as_str()))
}
