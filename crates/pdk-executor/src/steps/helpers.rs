//! Shared executor obligations.
//!
//! Free functions, deliberately not a base type: input validation,
//! environment merging, variable expansion, tool probing, and the
//! exec-to-result mapping every command-running executor shares.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

use pdk_core::context::ExecutionContext;
use pdk_core::error::{Error, Result};
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_core::sandbox::{ExecOutput, ExecRequest, OutputChannel, OutputLine};
use pdk_logging::Logger;

/// Fetch a required `with` input, expanded. `Err` carries a message
/// naming the missing key, ready for a pre-exec failure.
pub fn require_input(step: &Step, ctx: &ExecutionContext, key: &str) -> Result<String> {
    match step.with.get(key) {
        Some(value) => (ctx.expand)(value),
        None => Err(Error::InvalidInput(format!(
            "required input '{key}' is missing"
        ))),
    }
}

/// Optional `with` input, expanded.
pub fn optional_input(step: &Step, ctx: &ExecutionContext, key: &str) -> Result<Option<String>> {
    step.with.get(key).map(|v| (ctx.expand)(v)).transpose()
}

/// Merge the context environment with the step overlay, expanding every
/// step-level value. Step entries override context entries.
pub fn merged_env(step: &Step, ctx: &ExecutionContext) -> Result<BTreeMap<String, String>> {
    let mut env = ctx.env.clone();
    for (k, v) in &step.env {
        env.insert(k.clone(), (ctx.expand)(v)?);
    }
    Ok(env)
}

/// Resolve the step working directory with expansion applied.
pub fn working_dir(step: &Step, ctx: &ExecutionContext) -> Result<PathBuf> {
    match &step.working_dir {
        None => Ok(ctx.working_dir.clone()),
        Some(raw) => {
            let expanded = (ctx.expand)(raw)?;
            Ok(ctx.resolve_working_dir(Some(&expanded)))
        }
    }
}

/// POSIX single-quote escaping for a command argument.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Check that a tool exists inside the sandbox. Location in the error is
/// the job's image (or `host`).
pub async fn probe_tool(
    ctx: &ExecutionContext,
    tool: &str,
    suggestion: Option<&str>,
) -> Result<()> {
    let request = ExecRequest::new(
        format!("command -v {tool} >/dev/null 2>&1"),
        ctx.guest_workspace.clone(),
    )
    .with_cancel(ctx.cancel.clone());
    let available = match ctx.sandbox.exec(request).await {
        Ok(out) => out.success(),
        Err(_) => false,
    };
    if available {
        Ok(())
    } else {
        Err(Error::ToolNotFound {
            tool: tool.to_string(),
            location: ctx.job.image.clone(),
            suggestion: suggestion.map(str::to_string),
        })
    }
}

/// Run one command in the step's sandbox, streaming lines to the logger
/// as they arrive. Non-zero exit is a normal output, not an `Err`.
pub async fn exec_in_sandbox(
    source: &str,
    logger: &Logger,
    ctx: &ExecutionContext,
    env: BTreeMap<String, String>,
    working_dir: PathBuf,
    command: String,
) -> Result<ExecOutput> {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let forward_logger = logger.clone();
    let forward_source = source.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            match line.channel {
                OutputChannel::Stdout => {
                    forward_logger.info(&forward_source, &line.content, &[]);
                }
                OutputChannel::Stderr => {
                    forward_logger.info(
                        &forward_source,
                        &line.content,
                        &[("channel", "stderr".to_string())],
                    );
                }
            }
        }
    });

    let request = ExecRequest::new(command, working_dir)
        .with_env(env)
        .with_stream(tx)
        .with_cancel(ctx.cancel.clone());
    let result = ctx.sandbox.exec(request).await;
    let _ = forwarder.await;
    result
}

/// The standard single-command executor body: merge env, resolve the
/// working directory, run, and map to a step result.
pub async fn run_step_command(
    source: &str,
    logger: &Logger,
    step: &Step,
    ctx: &ExecutionContext,
    command: String,
) -> StepResult {
    let step_name = step.display_name().to_string();
    let started = Utc::now();

    let env = match merged_env(step, ctx) {
        Ok(env) => env,
        Err(e) => return StepResult::pre_exec_failure(step_name, e),
    };
    let workdir = match working_dir(step, ctx) {
        Ok(dir) => dir,
        Err(e) => return StepResult::pre_exec_failure(step_name, e),
    };

    match exec_in_sandbox(source, logger, ctx, env, workdir, command).await {
        Ok(out) => result_from_output(&step_name, started, out),
        Err(e) => exec_error_result(&step_name, e),
    }
}

pub fn result_from_output(step_name: &str, started: chrono::DateTime<Utc>, out: ExecOutput) -> StepResult {
    if out.success() {
        StepResult::success(step_name, out.exit_code, out.stdout, out.stderr, started)
    } else {
        StepResult::failure(step_name, out.exit_code, out.stdout, out.stderr, started)
    }
}

/// Map a substrate error (cancellation, torn exec channel) to a failed
/// result carrying the error kind.
pub fn exec_error_result(step_name: &str, error: Error) -> StepResult {
    StepResult::pre_exec_failure(step_name, format!("[{}] {error}", error.kind()))
}

/// Comma-separated list input with per-element trimming.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use pdk_core::pipeline::StepKind;
    use std::sync::Arc;

    #[test]
    fn missing_required_input_names_the_key() {
        let ctx = context();
        let step = step(StepKind::Dotnet);
        let err = require_input(&step, &ctx, "command").unwrap_err();
        assert!(err.to_string().contains("'command'"));
    }

    #[test]
    fn step_env_overrides_context_env() {
        let ctx = context();
        let mut s = step(StepKind::Script);
        s.env.insert("CTX".into(), "step-wins".into());
        s.env.insert("ONLY".into(), "step".into());
        let env = merged_env(&s, &ctx).unwrap();
        assert_eq!(env.get("CTX").map(String::as_str), Some("step-wins"));
        assert_eq!(env.get("ONLY").map(String::as_str), Some("step"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn split_list_trims_elements() {
        assert_eq!(
            split_list(" a , b,c ,, "),
            vec!["a".to_string(), "b".into(), "c".into()]
        );
    }

    #[tokio::test]
    async fn probe_tool_maps_failure_to_tool_not_found() {
        let sandbox = Arc::new(FakeSandbox::ok().respond(127, "", "not found"));
        let ctx = context_with(sandbox);
        let err = probe_tool(&ctx, "dotnet", Some("sdk image")).await.unwrap_err();
        match err {
            Error::ToolNotFound { tool, location, suggestion } => {
                assert_eq!(tool, "dotnet");
                assert_eq!(location, "ubuntu:22.04");
                assert_eq!(suggestion.as_deref(), Some("sdk image"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn run_step_command_maps_exit_codes() {
        let sandbox = Arc::new(FakeSandbox::ok().respond(2, "out", "err"));
        let ctx = context_with(sandbox);
        let s = step(StepKind::Script);
        let result =
            run_step_command("test", &Logger::disabled(), &s, &ctx, "exit 2".into()).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
    }
}
