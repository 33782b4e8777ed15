//! Checkout step executor.
//!
//! `repository: self` (or absent) only verifies the workspace is a git
//! tree. A real URL clones on first run and pulls afterwards; an optional
//! `ref`/`branch`/`tag` is checked out last. Each git sub-operation fails
//! with its own message so the user can tell clone, pull, and checkout
//! apart.

use async_trait::async_trait;
use chrono::Utc;

use pdk_core::context::ExecutionContext;
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_core::sandbox::ExecOutput;
use pdk_logging::Logger;

use super::StepExecutor;
use super::helpers;

const SOURCE: &str = "step:checkout";

pub struct CheckoutExecutor {
    logger: Logger,
}

impl CheckoutExecutor {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl StepExecutor for CheckoutExecutor {
    fn kind(&self) -> &'static str {
        "checkout"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();
        let started = Utc::now();

        let repository = match helpers::optional_input(step, ctx, "repository") {
            Ok(value) => value.unwrap_or_else(|| "self".to_string()),
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };
        let reference = match first_reference(step, ctx) {
            Ok(r) => r,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        if repository != "self" && repository.starts_with("http") {
            if let Err(e) = url::Url::parse(&repository) {
                return StepResult::pre_exec_failure(
                    step_name,
                    format!("repository '{repository}' is not a valid URL: {e}"),
                );
            }
        }

        if let Err(e) = helpers::probe_tool(ctx, "git", None).await {
            return StepResult::pre_exec_failure(step_name, e);
        }

        let env = match helpers::merged_env(step, ctx) {
            Ok(env) => env,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };
        let workdir = match helpers::working_dir(step, ctx) {
            Ok(dir) => dir,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        macro_rules! git {
            ($label:expr, $cmd:expr) => {{
                let out = match helpers::exec_in_sandbox(
                    SOURCE,
                    &self.logger,
                    ctx,
                    env.clone(),
                    workdir.clone(),
                    $cmd,
                )
                .await
                {
                    Ok(out) => out,
                    Err(e) => return helpers::exec_error_result(&step_name, e),
                };
                stdout.push_str(&out.stdout);
                stderr.push_str(&out.stderr);
                if !out.success() {
                    stderr.push_str(&format!("\n{} failed (exit {})", $label, out.exit_code));
                    return StepResult::failure(&step_name, out.exit_code, stdout, stderr, started);
                }
                out
            }};
        }

        if repository == "self" {
            let probe: ExecOutput = git!(
                "git rev-parse",
                "git rev-parse --is-inside-work-tree".to_string()
            );
            let _ = probe;
            stdout.push_str("workspace is already a git tree; nothing to do\n");
            return StepResult::success(&step_name, 0, stdout, stderr, started);
        }

        let has_repo = ctx.host_workspace.join(".git").is_dir();
        if has_repo {
            self.logger.debug(SOURCE, "existing clone found, pulling", &[]);
            git!("git pull", "git pull --ff-only".to_string());
        } else {
            git!(
                "git clone",
                format!("git clone {} .", helpers::shell_quote(&repository))
            );
        }

        if let Some(reference) = reference {
            git!(
                "git checkout",
                format!("git checkout {}", helpers::shell_quote(&reference))
            );
        }

        StepResult::success(&step_name, 0, stdout, stderr, started)
    }
}

/// `ref` wins over `branch` over `tag` when several are present.
fn first_reference(
    step: &Step,
    ctx: &ExecutionContext,
) -> pdk_core::Result<Option<String>> {
    for key in ["ref", "branch", "tag"] {
        if let Some(value) = helpers::optional_input(step, ctx, key)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::helpers::test_support::{FakeSandbox, context_with, step};
    use pdk_core::pipeline::StepKind;
    use std::sync::Arc;

    fn checkout_step(with: &[(&str, &str)]) -> Step {
        let mut s = step(StepKind::Checkout);
        for (k, v) in with {
            s.with.insert(k.to_string(), v.to_string());
        }
        s
    }

    #[tokio::test]
    async fn self_checkout_verifies_without_mutation() {
        // probe git ok, rev-parse ok
        let sandbox = Arc::new(FakeSandbox::ok().respond(0, "", "").respond(0, "true\n", ""));
        let ctx = context_with(Arc::clone(&sandbox) as _);
        let result = CheckoutExecutor::new(Logger::disabled())
            .execute(&checkout_step(&[("repository", "self")]), &ctx)
            .await;
        assert!(result.success);
        assert!(result.stdout.contains("already a git tree"));
        let commands = sandbox.recorded();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].contains("rev-parse"));
    }

    #[tokio::test]
    async fn absent_repository_means_self() {
        let sandbox = Arc::new(FakeSandbox::ok());
        let ctx = context_with(Arc::clone(&sandbox) as _);
        let result = CheckoutExecutor::new(Logger::disabled())
            .execute(&checkout_step(&[]), &ctx)
            .await;
        assert!(result.success);
        assert!(sandbox.recorded().iter().any(|c| c.contains("rev-parse")));
    }

    #[tokio::test]
    async fn url_clones_into_empty_workspace() {
        let ws = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(FakeSandbox::ok());
        let mut ctx = context_with(Arc::clone(&sandbox) as _);
        ctx.host_workspace = ws.path().to_path_buf();

        let result = CheckoutExecutor::new(Logger::disabled())
            .execute(
                &checkout_step(&[
                    ("repository", "https://example.com/repo.git"),
                    ("branch", "main"),
                ]),
                &ctx,
            )
            .await;
        assert!(result.success);
        let commands = sandbox.recorded();
        assert!(commands.iter().any(|c| c.starts_with("git clone")));
        assert!(commands.iter().any(|c| c == "git checkout 'main'"));
        assert!(!commands.iter().any(|c| c.contains("git pull")));
    }

    #[tokio::test]
    async fn existing_clone_pulls_instead() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join(".git")).unwrap();
        let sandbox = Arc::new(FakeSandbox::ok());
        let mut ctx = context_with(Arc::clone(&sandbox) as _);
        ctx.host_workspace = ws.path().to_path_buf();

        let result = CheckoutExecutor::new(Logger::disabled())
            .execute(
                &checkout_step(&[("repository", "https://example.com/repo.git")]),
                &ctx,
            )
            .await;
        assert!(result.success);
        let commands = sandbox.recorded();
        assert!(commands.iter().any(|c| c.contains("git pull")));
        assert!(!commands.iter().any(|c| c.contains("git clone")));
    }

    #[tokio::test]
    async fn clone_failure_names_the_sub_operation() {
        let ws = tempfile::tempdir().unwrap();
        // probe ok, clone fails
        let sandbox = Arc::new(
            FakeSandbox::ok()
                .respond(0, "", "")
                .respond(128, "", "fatal: repository not found"),
        );
        let mut ctx = context_with(Arc::clone(&sandbox) as _);
        ctx.host_workspace = ws.path().to_path_buf();

        let result = CheckoutExecutor::new(Logger::disabled())
            .execute(
                &checkout_step(&[("repository", "https://example.com/missing.git")]),
                &ctx,
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 128);
        assert!(result.stderr.contains("git clone failed"));
    }

    #[tokio::test]
    async fn missing_git_reports_tool_not_found() {
        let sandbox = Arc::new(FakeSandbox::ok().respond(127, "", ""));
        let ctx = context_with(sandbox as _);
        let result = CheckoutExecutor::new(Logger::disabled())
            .execute(&checkout_step(&[]), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("git"));
        assert!(result.stderr.contains("not found"));
    }
}
