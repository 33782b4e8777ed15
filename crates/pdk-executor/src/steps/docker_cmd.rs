//! Docker CLI step executor (`docker build|tag|run|push` inside the
//! sandbox).

use async_trait::async_trait;

use pdk_core::context::ExecutionContext;
use pdk_core::error::Error;
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_logging::Logger;

use super::StepExecutor;
use super::helpers;

const SOURCE: &str = "step:docker";

pub struct DockerCommandExecutor {
    logger: Logger,
}

impl DockerCommandExecutor {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    fn build_line(&self, step: &Step, ctx: &ExecutionContext) -> Result<String, Error> {
        let dockerfile = helpers::optional_input(step, ctx, "Dockerfile")?
            .unwrap_or_else(|| "Dockerfile".to_string());
        let context_dir =
            helpers::optional_input(step, ctx, "context")?.unwrap_or_else(|| ".".to_string());
        let mut line = format!("docker build -f {dockerfile}");
        if let Some(tags) = helpers::optional_input(step, ctx, "tags")? {
            for tag in helpers::split_list(&tags) {
                line.push_str(&format!(" -t {tag}"));
            }
        }
        if let Some(build_args) = helpers::optional_input(step, ctx, "buildArgs")? {
            for arg in helpers::split_list(&build_args) {
                line.push_str(&format!(" --build-arg {arg}"));
            }
        }
        if let Some(target) = helpers::optional_input(step, ctx, "target")? {
            line.push_str(&format!(" --target {target}"));
        }
        line.push(' ');
        line.push_str(&context_dir);
        Ok(line)
    }
}

#[async_trait]
impl StepExecutor for DockerCommandExecutor {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();

        let command = match helpers::require_input(step, ctx, "command") {
            Ok(c) => c,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let line = match command.as_str() {
            "build" => match self.build_line(step, ctx) {
                Ok(line) => line,
                Err(e) => return StepResult::pre_exec_failure(step_name, e),
            },
            "tag" => {
                let source_image = match helpers::require_input(step, ctx, "sourceImage") {
                    Ok(v) => v,
                    Err(e) => return StepResult::pre_exec_failure(step_name, e),
                };
                let target_tag = match helpers::require_input(step, ctx, "targetTag") {
                    Ok(v) => v,
                    Err(e) => return StepResult::pre_exec_failure(step_name, e),
                };
                format!("docker tag {source_image} {target_tag}")
            }
            "run" | "push" => {
                let image = match helpers::require_input(step, ctx, "image") {
                    Ok(v) => v,
                    Err(e) => return StepResult::pre_exec_failure(step_name, e),
                };
                if command == "run" {
                    let arguments = match helpers::optional_input(step, ctx, "arguments") {
                        Ok(a) => a.unwrap_or_default(),
                        Err(e) => return StepResult::pre_exec_failure(step_name, e),
                    };
                    let mut line = format!("docker run --rm {image}");
                    if !arguments.is_empty() {
                        line.push(' ');
                        line.push_str(&arguments);
                    }
                    line
                } else {
                    format!("docker push {image}")
                }
            }
            other => {
                return StepResult::pre_exec_failure(
                    step_name,
                    Error::UnsupportedCommand {
                        kind: "docker".into(),
                        command: other.to_string(),
                    },
                );
            }
        };

        if let Err(e) = helpers::probe_tool(ctx, "docker", None).await {
            return StepResult::pre_exec_failure(step_name, e);
        }

        helpers::run_step_command(SOURCE, &self.logger, step, ctx, line).await
    }
}
