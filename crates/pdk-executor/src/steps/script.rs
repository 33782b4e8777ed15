//! Script step executor.
//!
//! Single-line bodies go straight through the sandbox shell. Multi-line
//! bodies are written to a temp file under the shared workspace, marked
//! executable, run through the selected shell, and deleted on all paths.
//! PowerShell is not this executor's business; asking for it fails with
//! `UnsupportedShell`.

use async_trait::async_trait;

use pdk_core::context::ExecutionContext;
use pdk_core::error::Error;
use pdk_core::pipeline::{Shell, Step};
use pdk_core::result::StepResult;
use pdk_logging::Logger;

use super::StepExecutor;
use super::helpers;

const SOURCE: &str = "step:script";

/// Directory under the workspace for transient script files. Shared
/// between host and guest through the workspace mount.
const TMP_DIR: &str = ".pdk-tmp";

pub struct ScriptExecutor {
    logger: Logger,
}

impl ScriptExecutor {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl StepExecutor for ScriptExecutor {
    fn kind(&self) -> &'static str {
        "script"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();

        let Some(raw_body) = step.script.as_deref() else {
            return StepResult::pre_exec_failure(step_name, "required input 'script' is missing");
        };
        if let Some(shell) = step.shell {
            if shell.is_powershell() {
                return StepResult::pre_exec_failure(
                    step_name,
                    Error::UnsupportedShell(shell.program().to_string()),
                );
            }
        }
        let body = match (ctx.expand)(raw_body) {
            Ok(body) => body,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        if body.contains('\n') {
            self.run_multi_line(step, ctx, &body).await
        } else {
            let command = match step.shell {
                Some(Shell::Bash) => format!("bash -c {}", helpers::shell_quote(&body)),
                _ => body,
            };
            helpers::run_step_command(SOURCE, &self.logger, step, ctx, command).await
        }
    }
}

impl ScriptExecutor {
    async fn run_multi_line(&self, step: &Step, ctx: &ExecutionContext, body: &str) -> StepResult {
        let step_name = step.display_name().to_string();
        let file_name = format!("step-{}.sh", uuid::Uuid::new_v4().simple());
        let host_dir = ctx.host_workspace.join(TMP_DIR);
        let host_path = host_dir.join(&file_name);
        let guest_path = ctx.guest_workspace.join(TMP_DIR).join(&file_name);

        if let Err(e) = write_script(&host_path, body) {
            return StepResult::pre_exec_failure(step_name, e);
        }

        let shell = step.shell.as_ref().map(Shell::program).unwrap_or("sh");
        let command = format!("{shell} {}", guest_path.display());
        let result = helpers::run_step_command(SOURCE, &self.logger, step, ctx, command).await;

        // Best-effort cleanup on every path.
        if std::fs::remove_file(&host_path).is_err() {
            self.logger.debug(
                SOURCE,
                "temp script cleanup failed",
                &[("path", host_path.display().to_string())],
            );
        }
        let _ = std::fs::remove_dir(&host_dir);
        result
    }
}

fn write_script(path: &std::path::Path, body: &str) -> pdk_core::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
