//! Artifact definitions attached to upload/download steps.

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::{Error, Result};

static NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,100}$").unwrap());

/// What an upload/download step stages between steps and jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDefinition {
    /// Artifact name, `[A-Za-z0-9_-]{1,100}`.
    pub name: String,
    pub operation: ArtifactOperation,
    /// Glob include patterns, resolved against the sandbox filesystem.
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob exclude patterns.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Download target (or upload source base); defaults per operation.
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub options: ArtifactOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactOperation {
    Upload,
    Download,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactOptions {
    pub compression: Compression,
    pub if_no_files_found: IfNoFilesFound,
    /// Days the artifact survives retention sweeps. 0 keeps forever.
    pub retention_days: u32,
    pub overwrite: bool,
}

impl Default for ArtifactOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            if_no_files_found: IfNoFilesFound::Warn,
            retention_days: 0,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Zip,
}

/// Behavior when the include patterns match nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfNoFilesFound {
    Error,
    Warn,
    Ignore,
}

/// Policy when a downloaded file already exists at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Error,
    Skip,
    #[default]
    Overwrite,
}

impl ArtifactDefinition {
    pub fn validate(&self) -> Result<()> {
        if !NAME_RE.is_match(&self.name) {
            return Err(Error::InvalidInput(format!(
                "artifact name '{}' must match [A-Za-z0-9_-]{{1,100}}",
                self.name
            )));
        }
        if self.operation == ArtifactOperation::Upload && self.include.is_empty() {
            return Err(Error::InvalidInput(format!(
                "artifact '{}': upload requires at least one include pattern",
                self.name
            )));
        }
        Ok(())
    }
}
