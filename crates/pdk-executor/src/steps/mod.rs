//! Step executors and their registry.
//!
//! Each step kind has one executor: a struct exposing a kind tag and an
//! `execute` operation over the shared context. There is no executor base
//! class; the common obligations (input validation, env merge, working
//! directory resolution, variable expansion, tool probing) live in
//! [`helpers`] as free functions. Registries are per backend and
//! populated explicitly at startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use pdk_artifacts::ArtifactStore;
use pdk_core::context::ExecutionContext;
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_logging::Logger;

pub mod artifacts;
pub mod checkout;
pub mod docker_cmd;
pub mod dotnet;
pub mod helpers;
pub mod npm;
pub mod script;

pub use artifacts::{DownloadArtifactExecutor, UploadArtifactExecutor};
pub use checkout::CheckoutExecutor;
pub use docker_cmd::DockerCommandExecutor;
pub use dotnet::DotnetExecutor;
pub use npm::NpmExecutor;
pub use script::ScriptExecutor;

/// One executor per step kind.
///
/// Executors convert every recoverable failure into a failed
/// [`StepResult`] (exit code `-1` before execution, the child's exit code
/// afterwards); they never panic and never mutate the context.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Kind tag this executor answers to (lowercased).
    fn kind(&self) -> &'static str;

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult;
}

/// O(1) dispatch by lowercased kind. One registry per backend.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// The standard executor set, shared by both backends. The registry
    /// instances stay independent per backend; only the wiring is common.
    pub fn standard(logger: Logger, store: Arc<ArtifactStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CheckoutExecutor::new(logger.clone())));
        registry.register(Arc::new(ScriptExecutor::new(logger.clone())));
        registry.register(Arc::new(DotnetExecutor::new(logger.clone())));
        registry.register(Arc::new(NpmExecutor::new(logger.clone())));
        registry.register(Arc::new(DockerCommandExecutor::new(logger.clone())));
        registry.register(Arc::new(UploadArtifactExecutor::new(
            logger.clone(),
            Arc::clone(&store),
        )));
        registry.register(Arc::new(DownloadArtifactExecutor::new(logger, store)));
        registry
    }

    /// Register an executor; the last registration for a kind wins.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors
            .insert(executor.kind().to_lowercase(), executor);
    }

    pub fn get(&self, kind_key: &str) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(&kind_key.to_lowercase())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }

    /// Dispatch a step. An unknown kind yields a failed result with a
    /// clear diagnostic instead of an error.
    pub async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let key = step.kind.key();
        match self.get(&key) {
            Some(executor) => executor.execute(step, ctx).await,
            None => StepResult::pre_exec_failure(
                step.display_name(),
                format!(
                    "no executor registered for step kind '{key}'; known kinds: {}",
                    self.sorted_kinds().join(", ")
                ),
            ),
        }
    }

    fn sorted_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdk_core::pipeline::StepKind;
    use std::collections::BTreeMap;

    struct FixedExecutor(&'static str);

    #[async_trait]
    impl StepExecutor for FixedExecutor {
        fn kind(&self) -> &'static str {
            self.0
        }
        async fn execute(&self, step: &Step, _ctx: &ExecutionContext) -> StepResult {
            StepResult::skipped(step.display_name(), "fixed")
        }
    }

    fn step(kind: StepKind) -> Step {
        Step {
            id: "s1".into(),
            name: None,
            kind,
            script: None,
            shell: None,
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            working_dir: None,
            continue_on_error: None,
            condition: None,
            artifact: None,
        }
    }

    #[test]
    fn dispatch_is_case_insensitive() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(FixedExecutor("script")));
        assert!(registry.get("Script").is_some());
        assert!(registry.get("SCRIPT").is_some());
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(FixedExecutor("script")));
        registry.register(Arc::new(FixedExecutor("script")));
        assert_eq!(registry.kinds().count(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_yields_failed_result() {
        let registry = ExecutorRegistry::new();
        let ctx = helpers::test_support::context();
        let result = registry
            .execute(&step(StepKind::Unknown("mystery".into())), &ctx)
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, pdk_core::result::PRE_EXEC_FAILURE);
        assert!(result.stderr.contains("mystery"));
    }
}
