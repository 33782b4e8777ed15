//! Per-step execution context.
//!
//! The context is immutable for the duration of one step. Executors never
//! mutate it; when a field must change (environment overlay, working
//! directory), a new context is constructed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::RunId;
use crate::sandbox::Sandbox;

/// Variable expansion applied to script bodies, `with` values,
/// environment values, and working directories. Installed by the
/// orchestrator so executors stay decoupled from the resolver.
pub type Expander = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// An expander that returns its input unchanged.
pub fn identity_expander() -> Expander {
    Arc::new(|s: &str| Ok(s.to_string()))
}

/// Immutable job facts carried into every step of the job.
#[derive(Debug, Clone)]
pub struct JobMetadata {
    pub job_id: String,
    pub job_name: String,
    /// Symbolic runner name as declared.
    pub runner: String,
    /// Concrete image (or `host`).
    pub image: String,
}

/// Where artifact up/downloads for this step land in the store.
#[derive(Debug, Clone)]
pub struct ArtifactContext {
    pub run_id: RunId,
    pub job_name: String,
    pub step_index: usize,
}

/// Everything an executor needs to run one step.
#[derive(Clone)]
pub struct ExecutionContext {
    /// The job-scoped sandbox the step runs in.
    pub sandbox: Arc<dyn Sandbox>,
    /// Workspace path on the host.
    pub host_workspace: PathBuf,
    /// Workspace path inside the sandbox (`/workspace` for containers).
    pub guest_workspace: PathBuf,
    /// Merged environment: baseline < pipeline < job. Step env is overlaid
    /// by the executor via [`ExecutionContext::with_env_overlay`].
    pub env: BTreeMap<String, String>,
    /// Default working directory for the step.
    pub working_dir: PathBuf,
    pub job: JobMetadata,
    pub artifacts: Option<ArtifactContext>,
    pub cancel: CancelToken,
    /// Variable expansion for this step.
    pub expand: Expander,
}

impl ExecutionContext {
    /// A new context with `overlay` merged over this context's
    /// environment. The receiver is untouched.
    pub fn with_env_overlay(&self, overlay: &BTreeMap<String, String>) -> Self {
        let mut env = self.env.clone();
        for (k, v) in overlay {
            env.insert(k.clone(), v.clone());
        }
        Self {
            env,
            ..self.clone()
        }
    }

    /// A new context with a different working directory.
    pub fn with_working_dir(&self, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..self.clone()
        }
    }

    /// Resolve a step working directory: absolute paths are used as-is,
    /// relative paths join the guest workspace.
    pub fn resolve_working_dir(&self, dir: Option<&str>) -> PathBuf {
        match dir {
            None => self.working_dir.clone(),
            Some(d) => {
                let p = Path::new(d);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.guest_workspace.join(p)
                }
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("sandbox", &self.sandbox.id())
            .field("host_workspace", &self.host_workspace)
            .field("guest_workspace", &self.guest_workspace)
            .field("working_dir", &self.working_dir)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::sandbox::{ExecOutput, ExecRequest};
    use async_trait::async_trait;

    struct NullSandbox;

    #[async_trait]
    impl Sandbox for NullSandbox {
        fn id(&self) -> &str {
            "null"
        }
        fn workspace(&self) -> &Path {
            Path::new("/workspace")
        }
        async fn exec(&self, _request: ExecRequest) -> Result<ExecOutput> {
            unimplemented!()
        }
        async fn copy_in(&self, _host: &Path, _guest: &Path) -> Result<()> {
            unimplemented!()
        }
        async fn copy_out(&self, _guest: &Path, _host: &Path) -> Result<()> {
            unimplemented!()
        }
        async fn remove(&self) -> Result<()> {
            Ok(())
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext {
            sandbox: Arc::new(NullSandbox),
            host_workspace: PathBuf::from("/tmp/ws"),
            guest_workspace: PathBuf::from("/workspace"),
            env: BTreeMap::from([("A".into(), "job".into()), ("B".into(), "job".into())]),
            working_dir: PathBuf::from("/workspace"),
            job: JobMetadata {
                job_id: "build".into(),
                job_name: "build".into(),
                runner: "ubuntu-latest".into(),
                image: "ubuntu:22.04".into(),
            },
            artifacts: None,
            cancel: CancelToken::never(),
            expand: identity_expander(),
        }
    }

    #[test]
    fn env_overlay_constructs_new_context() {
        let ctx = context();
        let overlay = BTreeMap::from([("A".into(), "step".into()), ("C".into(), "step".into())]);
        let derived = ctx.with_env_overlay(&overlay);

        assert_eq!(derived.env.get("A").map(String::as_str), Some("step"));
        assert_eq!(derived.env.get("B").map(String::as_str), Some("job"));
        assert_eq!(derived.env.get("C").map(String::as_str), Some("step"));
        // the original is untouched
        assert_eq!(ctx.env.get("A").map(String::as_str), Some("job"));
        assert!(!ctx.env.contains_key("C"));
    }

    #[test]
    fn absolute_working_dir_used_as_is() {
        let ctx = context();
        assert_eq!(
            ctx.resolve_working_dir(Some("/opt/app")),
            PathBuf::from("/opt/app")
        );
    }

    #[test]
    fn relative_working_dir_joins_workspace() {
        let ctx = context();
        assert_eq!(
            ctx.resolve_working_dir(Some("src/api")),
            PathBuf::from("/workspace/src/api")
        );
    }

    #[test]
    fn missing_working_dir_falls_back_to_default() {
        let ctx = context();
        assert_eq!(ctx.resolve_working_dir(None), PathBuf::from("/workspace"));
    }
}
