//! .NET CLI step executor.

use async_trait::async_trait;

use pdk_core::context::ExecutionContext;
use pdk_core::error::Error;
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_logging::Logger;

use super::StepExecutor;
use super::helpers;

const SOURCE: &str = "step:dotnet";

const COMMANDS: &[&str] = &["restore", "build", "test", "publish", "run", "pack", "clean"];

/// Suggested when the tool is missing from the runner image.
const SDK_IMAGE: &str = "mcr.microsoft.com/dotnet/sdk:8.0";

pub struct DotnetExecutor {
    logger: Logger,
}

impl DotnetExecutor {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl StepExecutor for DotnetExecutor {
    fn kind(&self) -> &'static str {
        "dotnet"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();

        let command = match helpers::require_input(step, ctx, "command") {
            Ok(c) => c,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };
        if !COMMANDS.contains(&command.as_str()) {
            return StepResult::pre_exec_failure(
                step_name,
                Error::UnsupportedCommand {
                    kind: "dotnet".into(),
                    command,
                },
            );
        }

        if let Err(e) = helpers::probe_tool(ctx, "dotnet", Some(SDK_IMAGE)).await {
            return StepResult::pre_exec_failure(step_name, e);
        }

        let mut line = format!("dotnet {command}");
        match helpers::optional_input(step, ctx, "projects") {
            Ok(Some(projects)) => {
                line.push(' ');
                line.push_str(&projects);
            }
            Ok(None) => {}
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        }
        match helpers::optional_input(step, ctx, "configuration") {
            Ok(Some(configuration)) => {
                line.push_str(&format!(" --configuration {configuration}"));
            }
            Ok(None) => {}
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        }
        match helpers::optional_input(step, ctx, "outputPath") {
            Ok(Some(output)) => line.push_str(&format!(" --output {output}")),
            Ok(None) => {}
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        }
        match helpers::optional_input(step, ctx, "arguments") {
            Ok(Some(arguments)) => {
                line.push(' ');
                line.push_str(&arguments);
            }
            Ok(None) => {}
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        }

        helpers::run_step_command(SOURCE, &self.logger, step, ctx, line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::helpers::test_support::{FakeSandbox, context_with, step};
    use pdk_core::pipeline::StepKind;
    use std::sync::Arc;

    fn dotnet_step(with: &[(&str, &str)]) -> Step {
        let mut s = step(StepKind::Dotnet);
        for (k, v) in with {
            s.with.insert(k.to_string(), v.to_string());
        }
        s
    }

    async fn run(with: &[(&str, &str)]) -> (StepResult, Vec<String>) {
        let sandbox = Arc::new(FakeSandbox::ok());
        let ctx = context_with(Arc::clone(&sandbox) as _);
        let result = DotnetExecutor::new(Logger::disabled())
            .execute(&dotnet_step(with), &ctx)
            .await;
        (result, sandbox.recorded())
    }

    #[tokio::test]
    async fn assembles_full_command_line() {
        let (result, commands) = run(&[
            ("command", "build"),
            ("projects", "src/App.csproj"),
            ("configuration", "Release"),
            ("outputPath", "out"),
            ("arguments", "--no-restore"),
        ])
        .await;
        assert!(result.success);
        assert_eq!(
            commands[1],
            "dotnet build src/App.csproj --configuration Release --output out --no-restore"
        );
    }

    #[tokio::test]
    async fn bare_command_works() {
        let (result, commands) = run(&[("command", "restore")]).await;
        assert!(result.success);
        assert_eq!(commands[1], "dotnet restore");
    }

    #[tokio::test]
    async fn missing_command_is_pre_exec_failure() {
        let (result, commands) = run(&[]).await;
        assert!(!result.success);
        assert!(result.stderr.contains("'command'"));
        assert!(commands.is_empty(), "nothing should execute");
    }

    #[tokio::test]
    async fn unknown_command_is_unsupported() {
        let (result, _) = run(&[("command", "yeet")]).await;
        assert!(!result.success);
        assert!(result.stderr.contains("not supported"));
    }

    #[tokio::test]
    async fn missing_tool_suggests_sdk_image() {
        let sandbox = Arc::new(FakeSandbox::ok().respond(127, "", ""));
        let ctx = context_with(sandbox as _);
        let result = DotnetExecutor::new(Logger::disabled())
            .execute(&dotnet_step(&[("command", "build")]), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("dotnet"));
    }
}
