//! Error types for the PDK engine.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("config file not found: {}", path.display())]
    ConfigFileNotFound { path: PathBuf },

    #[error("config file is not valid JSON: {}: {detail}", path.display())]
    ConfigInvalidJson { path: PathBuf, detail: String },

    #[error("missing required variable '{name}': {message}")]
    MissingRequiredVariable { name: String, message: String },

    #[error("circular variable reference involving '{0}'")]
    CircularVariableReference(String),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("failed to pull image '{image}': {detail}")]
    ImagePullFailed { image: String, detail: String },

    #[error("failed to create container from '{image}': {detail}")]
    ContainerCreateFailed { image: String, detail: String },

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("required tool '{tool}' not found in {location}")]
    ToolNotFound {
        tool: String,
        location: String,
        suggestion: Option<String>,
    },

    #[error("shell '{0}' is not supported by this executor")]
    UnsupportedShell(String),

    #[error("command '{command}' is not supported for {kind} steps")]
    UnsupportedCommand { kind: String, command: String },

    #[error("artifact '{0}' already exists for this step")]
    ArtifactExists(String),

    #[error("artifact '{0}' not found")]
    ArtifactNotFound(String),

    #[error("artifact metadata corrupt: {}", .0.display())]
    ArtifactCorrupt(PathBuf),

    #[error("free disk space below floor: {available} bytes available, {floor} bytes required")]
    DiskSpaceLow { available: u64, floor: u64 },

    #[error("no files matched: {0}")]
    GlobNoMatch(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigurationInvalid(_) => "ConfigurationInvalid",
            Error::ConfigFileNotFound { .. } => "ConfigFileNotFound",
            Error::ConfigInvalidJson { .. } => "ConfigInvalidJson",
            Error::MissingRequiredVariable { .. } => "MissingRequiredVariable",
            Error::CircularVariableReference(_) => "CircularVariableReference",
            Error::EngineUnavailable(_) => "EngineUnavailable",
            Error::ImagePullFailed { .. } => "ImagePullFailed",
            Error::ContainerCreateFailed { .. } => "ContainerCreateFailed",
            Error::ExecFailed(_) => "ExecFailed",
            Error::ToolNotFound { .. } => "ToolNotFound",
            Error::UnsupportedShell(_) => "UnsupportedShell",
            Error::UnsupportedCommand { .. } => "UnsupportedCommand",
            Error::ArtifactExists(_) => "ArtifactExists",
            Error::ArtifactNotFound(_) => "ArtifactNotFound",
            Error::ArtifactCorrupt(_) => "ArtifactCorrupt",
            Error::DiskSpaceLow { .. } => "DiskSpaceLow",
            Error::GlobNoMatch(_) => "GlobNoMatch",
            Error::Cancelled => "Cancelled",
            Error::Timeout(_) => "Timeout",
            Error::InvalidInput(_) => "InvalidInput",
            Error::Io(_) => "Io",
            Error::Internal(_) => "Internal",
        }
    }

    /// Actionable next steps for the user, when we have any.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::EngineUnavailable(_) => Some(
                "check that Docker is running (`docker info`), or rerun with --host to \
                 execute directly on this machine"
                    .to_string(),
            ),
            Error::ImagePullFailed { image, .. } => Some(format!(
                "verify the image name '{image}' and your network connection, \
                 or pre-pull it with `docker pull {image}`"
            )),
            Error::ToolNotFound {
                tool, suggestion, ..
            } => Some(match suggestion {
                Some(s) => format!("install '{tool}', or use a runner image that ships it: {s}"),
                None => format!("install '{tool}' and make sure it is on PATH"),
            }),
            Error::MissingRequiredVariable { name, .. } => Some(format!(
                "set it with --var {name}=VALUE, the PDK_VAR_{name} environment variable, \
                 or a 'variables' entry in the config file"
            )),
            Error::DiskSpaceLow { .. } => Some(
                "free disk space, point 'artifacts.root' at a larger volume, or lower \
                 'artifacts.minFreeDiskMb' in the config file"
                    .to_string(),
            ),
            Error::ConfigFileNotFound { path } => Some(format!(
                "create {} or pass --config with the correct path",
                path.display()
            )),
            Error::CircularVariableReference(_) => {
                Some("break the cycle by removing one of the mutually-referencing definitions".to_string())
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An error annotated with where in the pipeline it happened.
///
/// Every user-visible error surface carries what happened (the error
/// itself), where (these fields), and suggested next steps
/// ([`Error::remediation`]).
#[derive(Debug)]
pub struct Diagnostic {
    pub error: Error,
    pub pipeline_file: Option<PathBuf>,
    pub job: Option<String>,
    pub step: Option<String>,
}

impl Diagnostic {
    pub fn new(error: Error) -> Self {
        Self {
            error,
            pipeline_file: None,
            job: None,
            step: None,
        }
    }

    pub fn in_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn in_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn in_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipeline_file = Some(path.into());
        self
    }

    /// Render the three-part surface: summary, location, hints.
    pub fn render(&self) -> String {
        let mut out = self.error.to_string();
        let mut loc = Vec::new();
        if let Some(f) = &self.pipeline_file {
            loc.push(format!("file {}", f.display()));
        }
        if let Some(j) = &self.job {
            loc.push(format!("job '{j}'"));
        }
        if let Some(s) = &self.step {
            loc.push(format!("step '{s}'"));
        }
        if !loc.is_empty() {
            out.push_str(&format!("\n  at: {}", loc.join(", ")));
        }
        if let Some(hint) = self.error.remediation() {
            out.push_str(&format!("\n  hint: {hint}"));
        }
        out
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(Error::Cancelled.kind(), "Cancelled");
        assert_eq!(
            Error::EngineUnavailable("gone".into()).kind(),
            "EngineUnavailable"
        );
        assert_eq!(
            Error::MissingRequiredVariable {
                name: "X".into(),
                message: "required".into()
            }
            .kind(),
            "MissingRequiredVariable"
        );
    }

    #[test]
    fn engine_unavailable_has_host_hint() {
        let hint = Error::EngineUnavailable("no socket".into())
            .remediation()
            .unwrap();
        assert!(hint.contains("--host"));
    }

    #[test]
    fn diagnostic_renders_location_and_hint() {
        let d = Diagnostic::new(Error::EngineUnavailable("no socket".into()))
            .in_job("build")
            .in_step("compile");
        let rendered = d.render();
        assert!(rendered.contains("job 'build'"));
        assert!(rendered.contains("step 'compile'"));
        assert!(rendered.contains("hint:"));
    }

    #[test]
    fn tool_not_found_carries_suggestion() {
        let err = Error::ToolNotFound {
            tool: "dotnet".into(),
            location: "ubuntu:22.04".into(),
            suggestion: Some("mcr.microsoft.com/dotnet/sdk:8.0".into()),
        };
        assert!(err.remediation().unwrap().contains("dotnet/sdk"));
    }
}
