//! Docker execution backend.
//!
//! One container per job, created from the mapped runner image with the
//! host workspace bind-mounted at `/workspace`, kept alive for the
//! duration of the job and exec'd into once per step. Speaks only five
//! operations against the engine: create+start, exec with streaming I/O,
//! archive get, archive put, stop+remove.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pdk_core::error::{Error, Result};
use pdk_core::sandbox::{
    ExecOutput, ExecRequest, OutputLine, Sandbox, SandboxProvider, SandboxSpec,
};

/// Fixed guest-side workspace mount point.
pub const GUEST_WORKSPACE: &str = "/workspace";

/// Seconds a container gets to stop before it is killed.
const STOP_GRACE_SECS: i64 = 5;

pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Use an existing client (tests, remote engines).
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        let mut last_error = None;
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pull warning");
                    last_error = Some(e.to_string());
                }
            }
        }
        // A pull failure is only fatal if the image is absent locally.
        if self.docker.inspect_image(image).await.is_err() {
            return Err(Error::ImagePullFailed {
                image: image.to_string(),
                detail: last_error.unwrap_or_else(|| "image not available locally".to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn start(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        if !self.is_available().await {
            return Err(Error::EngineUnavailable(
                "docker daemon did not answer ping".to_string(),
            ));
        }
        self.pull_image(&spec.image).await?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let binds = vec![format!(
            "{}:{}:rw",
            spec.host_workspace.display(),
            GUEST_WORKSPACE
        )];
        let host_config = HostConfig {
            binds: Some(binds),
            memory: spec.memory_bytes,
            nano_cpus: spec.cpus.map(|c| (c * 1e9) as i64),
            network_mode: spec.network.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            // Keep the container alive; steps exec into it.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some(GUEST_WORKSPACE.to_string()),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        debug!(container = %spec.name, image = %spec.image, "creating container");
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::ContainerCreateFailed {
                image: spec.image.clone(),
                detail: e.to_string(),
            })?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ContainerCreateFailed {
                image: spec.image.clone(),
                detail: format!("start failed: {e}"),
            })?;

        Ok(Box::new(DockerSandbox {
            docker: self.docker.clone(),
            container_id: created.id,
            name: spec.name,
            workspace: PathBuf::from(GUEST_WORKSPACE),
        }))
    }
}

pub struct DockerSandbox {
    docker: Docker,
    container_id: String,
    name: String,
    workspace: PathBuf,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let started = Instant::now();
        let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        request.command.clone(),
                    ]),
                    env: Some(env),
                    working_dir: Some(request.working_dir.display().to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::ExecFailed(format!("create_exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::ExecFailed(format!("start_exec: {e}")))?
        {
            StartExecResults::Attached { mut output, .. } => {
                let mut out_lines = LineBuffer::new(false, request.stream.clone());
                let mut err_lines = LineBuffer::new(true, request.stream.clone());
                loop {
                    tokio::select! {
                        chunk = output.next() => {
                            let Some(chunk) = chunk else { break };
                            match chunk {
                                Ok(bollard::container::LogOutput::StdOut { message }) => {
                                    let text = String::from_utf8_lossy(&message);
                                    stdout.push_str(&text);
                                    out_lines.push(&text);
                                }
                                Ok(bollard::container::LogOutput::StdErr { message }) => {
                                    let text = String::from_utf8_lossy(&message);
                                    stderr.push_str(&text);
                                    err_lines.push(&text);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(error = %e, "exec stream error");
                                    break;
                                }
                            }
                        }
                        _ = request.cancel.cancelled() => {
                            return Err(Error::Cancelled);
                        }
                    }
                }
                out_lines.flush();
                err_lines.flush();
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::ExecFailed(format!("inspect_exec: {e}")))?;
        let exit_code = inspect.exit_code.map(|c| c as i32).unwrap_or(-1);

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }

    async fn copy_in(&self, host_path: &Path, guest_path: &Path) -> Result<()> {
        let mut archive = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut archive);
            let name = guest_path
                .file_name()
                .ok_or_else(|| Error::InvalidInput("copy_in needs a file name".into()))?;
            if host_path.is_dir() {
                builder.append_dir_all(name, host_path)?;
            } else {
                builder.append_path_with_name(host_path, name)?;
            }
            builder.finish()?;
        }
        let parent = guest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("/"));
        let options = UploadToContainerOptions {
            path: parent.display().to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.name, Some(options), archive.into())
            .await
            .map_err(|e| Error::ExecFailed(format!("archive upload: {e}")))?;
        Ok(())
    }

    async fn copy_out(&self, guest_path: &Path, host_path: &Path) -> Result<()> {
        let options = DownloadFromContainerOptions {
            path: guest_path.display().to_string(),
        };
        let mut stream = self.docker.download_from_container(&self.name, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::ExecFailed(format!("archive download: {e}")))?;
            archive.extend_from_slice(&chunk);
        }

        // The engine wraps the tree in its basename; unpack to a scratch
        // dir and move the inner tree to the requested destination.
        let scratch = tempfile::tempdir()?;
        tar::Archive::new(archive.as_slice()).unpack(scratch.path())?;
        let inner = guest_path
            .file_name()
            .map(|n| scratch.path().join(n))
            .filter(|p| p.exists())
            .unwrap_or_else(|| scratch.path().to_path_buf());
        move_tree(&inner, host_path)?;
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let stop = self
            .docker
            .stop_container(&self.name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await;
        if let Err(e) = stop {
            debug!(container = %self.name, error = %e, "stop before remove failed");
        }
        let removed = self
            .docker
            .remove_container(
                &self.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match removed {
            Ok(()) => Ok(()),
            // Already gone is fine; remove must be idempotent.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Error::ExecFailed(format!("container remove: {e}"))),
        }
    }
}

/// Splits streamed chunks into whole lines for the live subscriber.
struct LineBuffer {
    pending: String,
    is_stderr: bool,
    stream: Option<mpsc::UnboundedSender<OutputLine>>,
}

impl LineBuffer {
    fn new(is_stderr: bool, stream: Option<mpsc::UnboundedSender<OutputLine>>) -> Self {
        Self {
            pending: String::new(),
            is_stderr,
            stream,
        }
    }

    fn push(&mut self, text: &str) {
        if self.stream.is_none() {
            return;
        }
        self.pending.push_str(text);
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.emit(line.trim_end_matches('\n'));
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }

    fn emit(&self, line: &str) {
        if let Some(tx) = &self.stream {
            let out = if self.is_stderr {
                OutputLine::stderr(line)
            } else {
                OutputLine::stdout(line)
            };
            let _ = tx.send(out);
        }
    }
}

fn move_tree(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            move_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(from, to).is_err() {
            std::fs::copy(from, to)?;
        }
    }
    Ok(())
}

/// Container name for one job of one run.
pub fn container_name(run_short: &str, job_id: &str) -> String {
    let job: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("pdk-{run_short}-{job}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_sanitized_and_prefixed() {
        let name = container_name("0123abcd4567", "build & test");
        assert!(name.starts_with("pdk-0123abcd4567-"));
        assert!(!name.contains(' '));
        assert!(!name.contains('&'));
    }

    #[test]
    fn line_buffer_emits_whole_lines_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = LineBuffer::new(false, Some(tx));
        buffer.push("par");
        buffer.push("tial\nsecond line\ntrail");
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.content, "partial");
        assert_eq!(second.content, "second line");
        assert!(rx.try_recv().is_err(), "trailing fragment not yet emitted");
        buffer.flush();
        assert_eq!(rx.try_recv().unwrap().content, "trail");
    }
}
