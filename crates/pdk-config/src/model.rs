//! The JSON configuration file.
//!
//! The engine accepts a resolved [`Configuration`]; file discovery is the
//! caller's business. Unknown keys are preserved so a configuration
//! emitted by the engine re-parses to an equivalent object.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use pdk_core::error::{Error, Result};

pub const SUPPORTED_VERSION: &str = "1.0";

static VAR_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Z_][A-Z0-9_]*$").unwrap());
static MEMORY_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^(?i)[0-9]+(k|m|g)$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Must be `"1.0"`.
    pub version: String,
    /// Variable names must match `^[A-Z_][A-Z0-9_]*$`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Names of secrets to pull from the encrypted store.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub artifacts: ArtifactStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named step-filter presets selectable from the CLI.
    #[serde(default)]
    pub step_filtering: BTreeMap<String, FilterPreset>,
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Unknown top-level keys, preserved for round-tripping.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION.to_string(),
            variables: BTreeMap::new(),
            secrets: Vec::new(),
            runner: RunnerConfig::default(),
            docker: DockerConfig::default(),
            artifacts: ArtifactStoreConfig::default(),
            logging: LoggingConfig::default(),
            step_filtering: BTreeMap::new(),
            performance: PerformanceConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

/// Which substrate executes jobs, and what to do when Docker is gone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    pub backend: Backend,
    pub fallback: Fallback,
    /// Emit a warning when `auto` falls back to the host.
    pub host_warnings: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Auto,
    Docker,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    #[default]
    Host,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerConfig {
    /// Image used when a job's runner cannot be mapped.
    pub default_image: Option<String>,
    /// `^[0-9]+(k|m|g)$`, case-insensitive.
    pub memory_limit: Option<String>,
    /// Fractional cores, >= 0.1.
    pub cpu_limit: Option<f64>,
    pub network: Option<String>,
}

impl DockerConfig {
    /// Memory limit in bytes, if configured.
    pub fn memory_bytes(&self) -> Option<i64> {
        let raw = self.memory_limit.as_deref()?;
        parse_memory(raw)
    }
}

fn parse_memory(raw: &str) -> Option<i64> {
    if !MEMORY_RE.is_match(raw) {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let n: i64 = digits.parse().ok()?;
    let mult = match unit.to_ascii_lowercase().as_str() {
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(n * mult)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactStoreConfig {
    /// Staging root; `~` expands to the home directory.
    pub root: PathBuf,
    /// Runs older than this are removed by the retention sweep. 0 keeps
    /// everything.
    pub retention_days: u32,
    /// Uploads fail early when free space drops below this floor.
    pub min_free_disk_mb: u64,
}

impl Default for ArtifactStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".pdk/artifacts"),
            retention_days: 30,
            min_free_disk_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// `error|warning|information|debug|trace`.
    pub level: String,
    /// Rotating plain-text log file; `~/.pdk/logs/pdk.log` by default.
    pub file: Option<PathBuf>,
    /// JSON-lines log file.
    pub json_file: Option<PathBuf>,
    pub max_file_bytes: u64,
    pub retained_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "information".to_string(),
            file: None,
            json_file: None,
            max_file_bytes: 10 * 1024 * 1024,
            retained_files: 5,
        }
    }
}

/// A named, reusable step-filter expression set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterPreset {
    pub steps: Vec<String>,
    pub skip_steps: Vec<String>,
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub container_reuse: bool,
    pub image_cache: bool,
    pub parallel_steps: bool,
    pub max_parallelism: usize,
    /// Guest path -> named volume for dependency caches.
    pub cache_mounts: BTreeMap<String, String>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            container_reuse: false,
            image_cache: true,
            parallel_steps: false,
            max_parallelism: 4,
            cache_mounts: BTreeMap::new(),
        }
    }
}

impl Configuration {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ConfigFileNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        let config: Configuration =
            serde_json::from_str(&content).map_err(|e| Error::ConfigInvalidJson {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all fields, accumulating every problem before failing.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.version != SUPPORTED_VERSION {
            problems.push(format!(
                "unsupported version '{}' (expected \"{SUPPORTED_VERSION}\")",
                self.version
            ));
        }
        for name in self.variables.keys() {
            if !VAR_NAME_RE.is_match(name) {
                problems.push(format!(
                    "variable name '{name}' must match ^[A-Z_][A-Z0-9_]*$"
                ));
            }
        }
        if let Some(mem) = self.docker.memory_limit.as_deref() {
            if !MEMORY_RE.is_match(mem) {
                problems.push(format!(
                    "docker.memoryLimit '{mem}' must match ^[0-9]+(k|m|g)$"
                ));
            }
        }
        if let Some(cpus) = self.docker.cpu_limit {
            if cpus < 0.1 {
                problems.push(format!("docker.cpuLimit {cpus} must be >= 0.1"));
            }
        }
        if self.performance.max_parallelism == 0 {
            problems.push("performance.maxParallelism must be >= 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigurationInvalid(problems.join("; ")))
        }
    }

    /// Artifact root with `~` expanded.
    pub fn artifact_root(&self) -> PathBuf {
        expand_home(&self.artifacts.root)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
