//! Provider-neutral pipeline model.
//!
//! Parsers for upstream CI formats (GitHub Actions, Azure DevOps) produce
//! this model; the engine never sees YAML. The model is immutable after
//! parsing and serde round-trippable, so a pipeline can also be loaded
//! directly from its JSON rendering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::artifact::ArtifactDefinition;
use crate::error::{Error, Result};

/// A complete pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline display name.
    pub name: String,
    /// Jobs in declaration order.
    pub jobs: Vec<Job>,
    /// Pipeline-level environment map.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pipeline-level variables (lowest-precedence user layer).
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// One job: a unit of work bound to a single sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique within the pipeline.
    pub id: String,
    /// Display name; falls back to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Symbolic runner name (`ubuntu-latest`) or a concrete image reference.
    pub runs_on: String,
    /// Steps in declaration order.
    pub steps: Vec<Step>,
    /// Job-level environment map.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Upstream job ids that must succeed first.
    #[serde(default)]
    pub needs: Vec<String>,
    /// Optional wall-clock timeout for the whole job.
    #[serde(default, with = "option_duration_secs")]
    pub timeout: Option<Duration>,
    /// Default for steps that leave their own flag unset.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Job {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// One step within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the job.
    pub id: String,
    /// Display name; falls back to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Selects the executor.
    pub kind: StepKind,
    /// Script body for `Script` steps.
    #[serde(default)]
    pub script: Option<String>,
    /// Shell selector for script execution.
    #[serde(default)]
    pub shell: Option<Shell>,
    /// Kind-specific inputs. Unknown keys are preserved for diagnostics
    /// but ignored by executors.
    #[serde(default)]
    pub with: BTreeMap<String, String>,
    /// Step-level environment map; overrides the job environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, relative to the workspace unless absolute.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Step-level override; `None` inherits the job flag.
    #[serde(default)]
    pub continue_on_error: Option<bool>,
    /// Opaque condition expression carried through for diagnostics.
    #[serde(default)]
    pub condition: Option<String>,
    /// Artifact definition for upload/download steps.
    #[serde(default)]
    pub artifact: Option<ArtifactDefinition>,
}

impl Step {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Effective continue-on-error: the step flag wins, the job flag is the
    /// default for steps that leave theirs unset.
    pub fn effective_continue_on_error(&self, job: &Job) -> bool {
        self.continue_on_error.unwrap_or(job.continue_on_error)
    }
}

/// The tag that selects which executor implements a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Checkout,
    Script,
    Dotnet,
    Npm,
    Docker,
    UploadArtifact,
    DownloadArtifact,
    /// A kind the parser recognized but the engine has no executor for.
    /// Preserved so diagnostics can name it.
    #[serde(untagged)]
    Unknown(String),
}

impl StepKind {
    /// Lowercased registry key.
    pub fn key(&self) -> String {
        match self {
            StepKind::Checkout => "checkout".into(),
            StepKind::Script => "script".into(),
            StepKind::Dotnet => "dotnet".into(),
            StepKind::Npm => "npm".into(),
            StepKind::Docker => "docker".into(),
            StepKind::UploadArtifact => "upload-artifact".into(),
            StepKind::DownloadArtifact => "download-artifact".into(),
            StepKind::Unknown(s) => s.to_lowercase(),
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Shell selector for script steps and host execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Sh,
    Pwsh,
    Powershell,
    Cmd,
}

impl Shell {
    pub fn program(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Sh => "sh",
            Shell::Pwsh => "pwsh",
            Shell::Powershell => "powershell",
            Shell::Cmd => "cmd",
        }
    }

    pub fn is_powershell(&self) -> bool {
        matches!(self, Shell::Pwsh | Shell::Powershell)
    }
}

impl Pipeline {
    /// Structural validation: unique job ids, unique step ids per job,
    /// known `needs` targets. Dependency cycles are reported by the
    /// dry-run validator, which has the error accumulator.
    pub fn validate(&self) -> Result<()> {
        let mut job_ids = HashSet::new();
        for job in &self.jobs {
            if !job_ids.insert(job.id.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate job id '{}' in pipeline '{}'",
                    job.id, self.name
                )));
            }
            let mut step_ids = HashSet::new();
            for step in &job.steps {
                if !step_ids.insert(step.id.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "duplicate step id '{}' in job '{}'",
                        step.id, job.id
                    )));
                }
                if let Some(artifact) = &step.artifact {
                    artifact.validate()?;
                }
            }
        }
        for job in &self.jobs {
            for dep in &job.needs {
                if !job_ids.contains(dep.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "job '{}' needs unknown job '{}'",
                        job.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Serialize `Option<Duration>` as whole seconds, matching the neutral
/// model's JSON rendering.
mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        ser: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_some(&d.as_secs()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: None,
            kind: StepKind::Script,
            script: Some("echo hi".to_string()),
            shell: None,
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            working_dir: None,
            continue_on_error: None,
            condition: None,
            artifact: None,
        }
    }

    fn job(id: &str, steps: Vec<Step>) -> Job {
        Job {
            id: id.to_string(),
            name: None,
            runs_on: "ubuntu-latest".to_string(),
            steps,
            env: BTreeMap::new(),
            needs: vec![],
            timeout: None,
            continue_on_error: false,
        }
    }

    #[test]
    fn duplicate_job_ids_rejected() {
        let pipeline = Pipeline {
            name: "p".into(),
            jobs: vec![job("build", vec![]), job("build", vec![])],
            env: BTreeMap::new(),
            variables: BTreeMap::new(),
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn duplicate_step_ids_rejected() {
        let pipeline = Pipeline {
            name: "p".into(),
            jobs: vec![job("build", vec![script_step("a"), script_step("a")])],
            env: BTreeMap::new(),
            variables: BTreeMap::new(),
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn unknown_needs_rejected() {
        let mut j = job("build", vec![]);
        j.needs.push("missing".to_string());
        let pipeline = Pipeline {
            name: "p".into(),
            jobs: vec![j],
            env: BTreeMap::new(),
            variables: BTreeMap::new(),
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn step_inherits_job_continue_on_error() {
        let mut j = job("build", vec![script_step("a")]);
        j.continue_on_error = true;
        assert!(j.steps[0].effective_continue_on_error(&j));

        let mut explicit = script_step("b");
        explicit.continue_on_error = Some(false);
        assert!(!explicit.effective_continue_on_error(&j));
    }

    #[test]
    fn kind_keys_are_lowercase() {
        assert_eq!(StepKind::UploadArtifact.key(), "upload-artifact");
        assert_eq!(StepKind::Unknown("MyStep".into()).key(), "mystep");
    }

    #[test]
    fn model_round_trips_through_json() {
        let pipeline = Pipeline {
            name: "ci".into(),
            jobs: vec![job("build", vec![script_step("compile")])],
            env: BTreeMap::from([("CI".into(), "true".into())]),
            variables: BTreeMap::new(),
        };
        let json = serde_json::to_string(&pipeline).unwrap();
        let back: Pipeline = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "ci");
        assert_eq!(back.jobs[0].steps[0].kind, StepKind::Script);
        assert_eq!(back.env.get("CI").map(String::as_str), Some("true"));
    }

    #[test]
    fn timeout_serializes_as_seconds() {
        let mut j = job("build", vec![]);
        j.timeout = Some(Duration::from_secs(90));
        let json = serde_json::to_value(&j).unwrap();
        assert_eq!(json["timeout"], 90);
    }
}
