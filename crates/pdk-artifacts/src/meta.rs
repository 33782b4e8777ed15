//! Artifact metadata records.
//!
//! `artifact.metadata.json` sits beside the stored files and is written
//! once; it is never updated in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use pdk_core::artifact::Compression;
use pdk_core::error::{Error, Result};

pub const METADATA_FILE: &str = "artifact.metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub uploaded_at: DateTime<Utc>,
    pub job: String,
    pub step: String,
    pub file_count: usize,
    pub total_bytes: u64,
    pub compression: Compression,
    /// Days this artifact survives retention sweeps; 0 defers to the
    /// store default.
    pub retention_days: u32,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path inside the sandbox the file came from.
    pub source: String,
    /// Path relative to the artifact directory (or inside the archive).
    pub stored: String,
    pub size: u64,
    pub sha256: String,
}

impl ArtifactMetadata {
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Internal(format!("metadata serialization failed: {e}")))?;
        std::fs::write(dir.join(METADATA_FILE), json)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let content = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ArtifactCorrupt(path.clone()),
            _ => Error::Io(e),
        })?;
        serde_json::from_slice(&content).map_err(|_| Error::ArtifactCorrupt(path))
    }
}
