//! npm step executor.
//!
//! `build` and `test` translate to `npm run build` / `npm test`; `run`
//! requires a `script` input, with extra arguments separated by `--`.

use async_trait::async_trait;

use pdk_core::context::ExecutionContext;
use pdk_core::error::Error;
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_logging::Logger;

use super::StepExecutor;
use super::helpers;

const SOURCE: &str = "step:npm";

const COMMANDS: &[&str] = &["install", "ci", "build", "test", "start", "publish", "run"];

const NODE_IMAGE: &str = "node:20";

pub struct NpmExecutor {
    logger: Logger,
}

impl NpmExecutor {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl StepExecutor for NpmExecutor {
    fn kind(&self) -> &'static str {
        "npm"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();

        let command = match helpers::optional_input(step, ctx, "command") {
            Ok(value) => value.unwrap_or_else(|| "install".to_string()),
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };
        if !COMMANDS.contains(&command.as_str()) {
            return StepResult::pre_exec_failure(
                step_name,
                Error::UnsupportedCommand {
                    kind: "npm".into(),
                    command,
                },
            );
        }

        let arguments = match helpers::optional_input(step, ctx, "arguments") {
            Ok(a) => a,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let mut line = match command.as_str() {
            "build" => "npm run build".to_string(),
            "test" => "npm test".to_string(),
            "run" => {
                let script = match helpers::optional_input(step, ctx, "script") {
                    Ok(Some(script)) => script,
                    Ok(None) => {
                        return StepResult::pre_exec_failure(
                            step_name,
                            "npm run requires a 'script' input",
                        );
                    }
                    Err(e) => return StepResult::pre_exec_failure(step_name, e),
                };
                format!("npm run {script}")
            }
            other => format!("npm {other}"),
        };
        if let Some(arguments) = arguments {
            if command == "run" {
                // script-local args go after the conventional separator
                line.push_str(" -- ");
            } else {
                line.push(' ');
            }
            line.push_str(&arguments);
        }

        // npm is a node shim; both have to be present.
        for tool in ["node", "npm"] {
            if let Err(e) = helpers::probe_tool(ctx, tool, Some(NODE_IMAGE)).await {
                return StepResult::pre_exec_failure(step_name, e);
            }
        }

        helpers::run_step_command(SOURCE, &self.logger, step, ctx, line).await
    }
}
