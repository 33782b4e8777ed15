//! The execution substrate contract.
//!
//! Two interchangeable providers implement this: a Docker backend that
//! runs each job in an ephemeral container, and a host backend whose
//! "sandbox" is a workspace directory plus native subprocess spawn. The
//! orchestrator only ever talks to these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::Result;

/// Everything needed to start a job-scoped sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Sandbox name; containers are created under this name.
    pub name: String,
    /// Concrete image reference. Ignored by the host backend.
    pub image: String,
    /// Host directory mounted as the workspace.
    pub host_workspace: PathBuf,
    /// Environment baked into the sandbox.
    pub env: BTreeMap<String, String>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU limit in fractional cores.
    pub cpus: Option<f64>,
    /// Container network mode (`bridge`, `none`, ...).
    pub network: Option<String>,
}

/// One command execution inside a sandbox.
pub struct ExecRequest {
    /// Shell command string; the sandbox picks the shell.
    pub command: String,
    /// Working directory inside the sandbox.
    pub working_dir: PathBuf,
    /// Environment overlay for this exec only.
    pub env: BTreeMap<String, String>,
    /// Live output subscriber; lines are sent as they are read, in
    /// addition to being captured in the result.
    pub stream: Option<mpsc::UnboundedSender<OutputLine>>,
    pub cancel: CancelToken,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            stream: None,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stream(mut self, stream: mpsc::UnboundedSender<OutputLine>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Captured result of one exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A line of live output from a running command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub channel: OutputChannel,
    pub content: String,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: OutputChannel::Stdout,
            content: content.into(),
        }
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: OutputChannel::Stderr,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// A provider can report availability and start sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Backend name (`docker`, `host`).
    fn name(&self) -> &'static str;

    /// Whether the backing engine is reachable. The orchestrator uses
    /// this to decide fallback.
    async fn is_available(&self) -> bool;

    /// Create and start a job-scoped sandbox.
    async fn start(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>>;
}

/// A running job-scoped sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend-specific identifier (container id, or workspace path).
    fn id(&self) -> &str;

    /// Workspace path as seen from inside the sandbox. Fixed at
    /// `/workspace` for containers; the host workspace dir otherwise.
    fn workspace(&self) -> &Path;

    /// Execute a command, streaming output live and capturing it.
    /// A non-zero exit is a normal `ExecOutput`, not an error.
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;

    /// Copy a host file or directory tree into the sandbox.
    async fn copy_in(&self, host_path: &Path, guest_path: &Path) -> Result<()>;

    /// Copy a sandbox file or directory tree out to the host.
    async fn copy_out(&self, guest_path: &Path, host_path: &Path) -> Result<()>;

    /// Gracefully stop and remove the sandbox. Idempotent; forced after
    /// the grace deadline.
    async fn remove(&self) -> Result<()>;
}
