//! Host execution backend.
//!
//! The "sandbox" is simply a workspace directory; commands spawn as
//! native subprocesses through the platform shell, with the sandbox
//! environment merged over the parent environment.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use pdk_core::error::{Error, Result};
use pdk_core::pipeline::Shell;
use pdk_core::sandbox::{
    ExecOutput, ExecRequest, OutputLine, Sandbox, SandboxProvider, SandboxSpec,
};

/// Grace period between SIGTERM-equivalent and forced kill.
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub struct HostProvider;

impl HostProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for HostProvider {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn start(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        std::fs::create_dir_all(&spec.host_workspace)?;
        let workspace = spec
            .host_workspace
            .canonicalize()
            .unwrap_or(spec.host_workspace.clone());
        debug!(workspace = %workspace.display(), "host sandbox ready");
        Ok(Box::new(HostSandbox {
            id: workspace.display().to_string(),
            workspace,
            base_env: spec.env,
        }))
    }
}

pub struct HostSandbox {
    id: String,
    workspace: PathBuf,
    base_env: BTreeMap<String, String>,
}

/// Pick the shell for a command line. `cmd` on Windows, `sh` on Unix;
/// `pwsh`/`powershell` and `bash` are honored when requested and present.
pub fn shell_invocation(requested: Option<Shell>) -> Result<(String, &'static str)> {
    match requested {
        Some(shell) if shell.is_powershell() => {
            let program = shell.program();
            if which::which(program).is_err() {
                return Err(Error::ToolNotFound {
                    tool: program.to_string(),
                    location: "host".to_string(),
                    suggestion: None,
                });
            }
            Ok((program.to_string(), "-Command"))
        }
        Some(Shell::Cmd) => Ok(("cmd".to_string(), "/C")),
        Some(Shell::Bash) => Ok(("bash".to_string(), "-c")),
        Some(Shell::Sh) => Ok(("sh".to_string(), "-c")),
        None => {
            if cfg!(windows) {
                Ok(("cmd".to_string(), "/C"))
            } else {
                Ok(("sh".to_string(), "-c"))
            }
        }
        _ => unreachable!("Shell::is_powershell covers Pwsh and Powershell"),
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let started = Instant::now();
        let (program, flag) = shell_invocation(None)?;

        let mut command = Command::new(&program);
        command
            .arg(flag)
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // parent env is inherited; sandbox env and per-exec env overlay it
        for (k, v) in &self.base_env {
            command.env(k, v);
        }
        for (k, v) in &request.env {
            command.env(k, v);
        }
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecFailed(format!("failed to spawn {program}: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let out_task = read_lines(stdout, request.stream.clone(), false);
        let err_task = read_lines(stderr, request.stream.clone(), true);

        let cancel = request.cancel;
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::ExecFailed(e.to_string()))?;
                let stdout = out_task.await.unwrap_or_default();
                let stderr = err_task.await.unwrap_or_default();
                Ok(ExecOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    duration: started.elapsed(),
                })
            }
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                out_task.abort();
                err_task.abort();
                Err(Error::Cancelled)
            }
        }
    }

    async fn copy_in(&self, host_path: &Path, guest_path: &Path) -> Result<()> {
        let dest = resolve_guest(&self.workspace, guest_path);
        copy_tree(host_path, &dest)
    }

    async fn copy_out(&self, guest_path: &Path, host_path: &Path) -> Result<()> {
        let src = resolve_guest(&self.workspace, guest_path);
        copy_tree(&src, host_path)
    }

    /// The workspace belongs to the user; nothing to tear down.
    async fn remove(&self) -> Result<()> {
        Ok(())
    }
}

/// Ask the child to stop, wait out the grace period, then force it.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM first so well-behaved children clean up.
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Stream lines into the subscriber while accumulating the full capture.
fn read_lines<R>(
    reader: R,
    stream: Option<mpsc::UnboundedSender<OutputLine>>,
    is_stderr: bool,
) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = String::new();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tx) = &stream {
                let out = if is_stderr {
                    OutputLine::stderr(line.clone())
                } else {
                    OutputLine::stdout(line.clone())
                };
                let _ = tx.send(out);
            }
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    })
}

fn resolve_guest(workspace: &Path, guest: &Path) -> PathBuf {
    if guest.is_absolute() {
        guest.to_path_buf()
    } else {
        workspace.join(guest)
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdk_core::cancel::CancelSource;
    use std::collections::BTreeMap;

    async fn sandbox() -> (tempfile::TempDir, Box<dyn Sandbox>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = HostProvider::new();
        let sb = provider
            .start(SandboxSpec {
                name: "test".into(),
                image: String::new(),
                host_workspace: dir.path().to_path_buf(),
                env: BTreeMap::from([("SANDBOX_VAR".into(), "present".into())]),
                memory_bytes: None,
                cpus: None,
                network: None,
            })
            .await
            .unwrap();
        (dir, sb)
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let (_dir, sb) = sandbox().await;
        let out = sb
            .exec(ExecRequest::new("echo hello world", sb.workspace()))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("hello world"));
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn exec_captures_stderr_separately() {
        let (_dir, sb) = sandbox().await;
        let out = sb
            .exec(ExecRequest::new("echo oops 1>&2; exit 3", sb.workspace()))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.is_empty());
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn exec_env_overlays_parent() {
        let (_dir, sb) = sandbox().await;
        let req = ExecRequest::new("echo $SANDBOX_VAR-$EXTRA", sb.workspace()).with_env(
            BTreeMap::from([("EXTRA".into(), "overlay".into())]),
        );
        let out = sb.exec(req).await.unwrap();
        assert!(out.stdout.contains("present-overlay"));
    }

    #[tokio::test]
    async fn exec_streams_lines_live() {
        let (_dir, sb) = sandbox().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = ExecRequest::new("echo one; echo two 1>&2", sb.workspace()).with_stream(tx);
        sb.exec(req).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            seen.push(line);
        }
        assert!(seen.iter().any(|l| l.content == "one"));
        assert!(seen
            .iter()
            .any(|l| l.content == "two"
                && l.channel == pdk_core::sandbox::OutputChannel::Stderr));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let (_dir, sb) = sandbox().await;
        let source = CancelSource::new();
        let req =
            ExecRequest::new("sleep 30", sb.workspace()).with_cancel(source.token());

        let started = Instant::now();
        let exec = tokio::spawn(async move { sb.exec(req).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        source.cancel();
        let result = exec.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn working_dir_is_respected() {
        let (dir, sb) = sandbox().await;
        let sub = dir.path().join("nested");
        std::fs::create_dir_all(&sub).unwrap();
        let out = sb.exec(ExecRequest::new("pwd", &sub)).await.unwrap();
        assert!(out.stdout.trim().ends_with("nested"));
    }

    #[tokio::test]
    async fn copy_in_and_out_preserve_structure() {
        let (_dir, sb) = sandbox().await;
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/file.txt"), "payload").unwrap();

        sb.copy_in(src.path(), Path::new("incoming")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(sb.workspace().join("incoming/a/b/file.txt")).unwrap(),
            "payload"
        );

        let out = tempfile::tempdir().unwrap();
        sb.copy_out(Path::new("incoming"), &out.path().join("got"))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(out.path().join("got/a/b/file.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn shell_selection_defaults_by_platform() {
        let (program, flag) = shell_invocation(None).unwrap();
        if cfg!(windows) {
            assert_eq!((program.as_str(), flag), ("cmd", "/C"));
        } else {
            assert_eq!((program.as_str(), flag), ("sh", "-c"));
        }
    }

    #[test]
    fn missing_powershell_reports_tool_not_found() {
        if which::which("pwsh").is_err() {
            let err = shell_invocation(Some(Shell::Pwsh)).unwrap_err();
            assert!(matches!(err, Error::ToolNotFound { .. }));
        }
    }
}
