//! Upload/download artifact executors.
//!
//! Thin adapters over the artifact store: they validate that the step
//! carries an [`ArtifactDefinition`] matching their operation and that
//! the execution context has an artifact context, then delegate.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use pdk_artifacts::ArtifactStore;
use pdk_artifacts::store::ArtifactScope;
use pdk_core::artifact::{ArtifactDefinition, ArtifactOperation, ConflictPolicy};
use pdk_core::context::{ArtifactContext, ExecutionContext};
use pdk_core::pipeline::Step;
use pdk_core::result::StepResult;
use pdk_logging::Logger;

use super::StepExecutor;
use super::helpers;

const UPLOAD_SOURCE: &str = "step:upload-artifact";
const DOWNLOAD_SOURCE: &str = "step:download-artifact";

/// Default download target under the workspace.
const DOWNLOAD_DIR: &str = "artifacts";

fn prerequisites<'a>(
    step: &'a Step,
    ctx: &'a ExecutionContext,
    wanted: ArtifactOperation,
) -> Result<(&'a ArtifactDefinition, &'a ArtifactContext), String> {
    let Some(definition) = step.artifact.as_ref() else {
        return Err("step has no artifact definition".to_string());
    };
    let Some(artifacts) = ctx.artifacts.as_ref() else {
        return Err("execution context has no artifact context".to_string());
    };
    if definition.operation != wanted {
        return Err(format!(
            "artifact '{}' is declared for {:?}, not {:?}",
            definition.name, definition.operation, wanted
        ));
    }
    Ok((definition, artifacts))
}

/// Expand variables in the definition's patterns and target path.
fn expand_definition(
    definition: &ArtifactDefinition,
    ctx: &ExecutionContext,
) -> pdk_core::Result<ArtifactDefinition> {
    let mut expanded = definition.clone();
    expanded.name = (ctx.expand)(&definition.name)?;
    expanded.include = definition
        .include
        .iter()
        .map(|p| (ctx.expand)(p))
        .collect::<pdk_core::Result<_>>()?;
    expanded.exclude = definition
        .exclude
        .iter()
        .map(|p| (ctx.expand)(p))
        .collect::<pdk_core::Result<_>>()?;
    expanded.target_path = definition
        .target_path
        .as_deref()
        .map(|p| (ctx.expand)(p))
        .transpose()?;
    Ok(expanded)
}

pub struct UploadArtifactExecutor {
    logger: Logger,
    store: Arc<ArtifactStore>,
}

impl UploadArtifactExecutor {
    pub fn new(logger: Logger, store: Arc<ArtifactStore>) -> Self {
        Self { logger, store }
    }
}

#[async_trait]
impl StepExecutor for UploadArtifactExecutor {
    fn kind(&self) -> &'static str {
        "upload-artifact"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();
        let started = Utc::now();

        let (definition, artifacts) = match prerequisites(step, ctx, ArtifactOperation::Upload) {
            Ok(ok) => ok,
            Err(message) => return StepResult::pre_exec_failure(step_name, message),
        };
        let definition = match expand_definition(definition, ctx) {
            Ok(d) => d,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let scope = ArtifactScope {
            run_id: artifacts.run_id,
            job: artifacts.job_name.clone(),
            step: step_name.clone(),
        };
        let store = Arc::clone(&self.store);
        let source_root = ctx.host_workspace.clone();
        let upload = tokio::task::spawn_blocking(move || {
            store.upload(&scope, &definition, &source_root)
        })
        .await;

        match upload {
            Ok(Ok(outcome)) => {
                if let Some(warning) = &outcome.warning {
                    self.logger.warning(UPLOAD_SOURCE, warning, &[]);
                }
                let summary = if outcome.stored {
                    format!(
                        "uploaded {} file(s), {} bytes",
                        outcome.file_count, outcome.total_bytes
                    )
                } else {
                    outcome
                        .warning
                        .clone()
                        .unwrap_or_else(|| "nothing to upload".to_string())
                };
                self.logger.info(UPLOAD_SOURCE, &summary, &[]);
                StepResult::success(&step_name, 0, summary, String::new(), started)
            }
            Ok(Err(e)) => StepResult::pre_exec_failure(&step_name, e),
            Err(join) => StepResult::pre_exec_failure(&step_name, format!("upload task: {join}")),
        }
    }
}

pub struct DownloadArtifactExecutor {
    logger: Logger,
    store: Arc<ArtifactStore>,
}

impl DownloadArtifactExecutor {
    pub fn new(logger: Logger, store: Arc<ArtifactStore>) -> Self {
        Self { logger, store }
    }
}

#[async_trait]
impl StepExecutor for DownloadArtifactExecutor {
    fn kind(&self) -> &'static str {
        "download-artifact"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepResult {
        let step_name = step.display_name().to_string();
        let started = Utc::now();

        let (definition, artifacts) = match prerequisites(step, ctx, ArtifactOperation::Download) {
            Ok(ok) => ok,
            Err(message) => return StepResult::pre_exec_failure(step_name, message),
        };
        let definition = match expand_definition(definition, ctx) {
            Ok(d) => d,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let target = match definition.target_path.as_deref() {
            Some(path) => {
                let p = PathBuf::from(path);
                if p.is_absolute() {
                    p
                } else {
                    ctx.host_workspace.join(p)
                }
            }
            None => ctx.host_workspace.join(DOWNLOAD_DIR),
        };

        let conflict = match helpers::optional_input(step, ctx, "conflict") {
            Ok(Some(raw)) => match raw.to_ascii_lowercase().as_str() {
                "error" => ConflictPolicy::Error,
                "skip" => ConflictPolicy::Skip,
                "overwrite" => ConflictPolicy::Overwrite,
                other => {
                    return StepResult::pre_exec_failure(
                        step_name,
                        format!("unknown conflict policy '{other}'"),
                    );
                }
            },
            Ok(None) => ConflictPolicy::default(),
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let job_filter = match helpers::optional_input(step, ctx, "job") {
            Ok(j) => j,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };
        let step_filter = match helpers::optional_input(step, ctx, "step") {
            Ok(s) => s,
            Err(e) => return StepResult::pre_exec_failure(step_name, e),
        };

        let store = Arc::clone(&self.store);
        let run_id = artifacts.run_id;
        let name = definition.name.clone();
        let target_clone = target.clone();
        let download = tokio::task::spawn_blocking(move || {
            store.download(
                &run_id,
                &name,
                job_filter.as_deref(),
                step_filter.as_deref(),
                &target_clone,
                conflict,
            )
        })
        .await;

        match download {
            Ok(Ok(outcome)) => {
                let summary = format!(
                    "downloaded {} file(s) into {}{}",
                    outcome.file_count,
                    outcome.target.display(),
                    if outcome.skipped > 0 {
                        format!(" ({} skipped)", outcome.skipped)
                    } else {
                        String::new()
                    }
                );
                self.logger.info(DOWNLOAD_SOURCE, &summary, &[]);
                StepResult::success(&step_name, 0, summary, String::new(), started)
            }
            Ok(Err(e)) => StepResult::pre_exec_failure(&step_name, e),
            Err(join) => StepResult::pre_exec_failure(&step_name, format!("download task: {join}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::helpers::test_support::{context, step};
    use pdk_core::RunId;
    use pdk_core::artifact::{ArtifactOptions, Compression, IfNoFilesFound};
    use pdk_core::pipeline::StepKind;

    fn store(dir: &std::path::Path) -> Arc<ArtifactStore> {
        Arc::new(ArtifactStore::new(dir, 30, 0))
    }

    fn upload_def(name: &str, include: &[&str]) -> ArtifactDefinition {
        ArtifactDefinition {
            name: name.into(),
            operation: ArtifactOperation::Upload,
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: vec![],
            target_path: None,
            options: ArtifactOptions {
                compression: Compression::None,
                if_no_files_found: IfNoFilesFound::Warn,
                retention_days: 0,
                overwrite: false,
            },
        }
    }

    fn artifact_ctx(ws: &std::path::Path, run_id: RunId) -> ExecutionContext {
        let mut ctx = context();
        ctx.host_workspace = ws.to_path_buf();
        ctx.artifacts = Some(ArtifactContext {
            run_id,
            job_name: "build".into(),
            step_index: 0,
        });
        ctx
    }

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join("bin")).unwrap();
        std::fs::write(ws.path().join("bin/a.dll"), "payload-a").unwrap();
        std::fs::write(ws.path().join("bin/b.dll"), "payload-b").unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = store(store_dir.path());
        let run_id = RunId::new();
        let ctx = artifact_ctx(ws.path(), run_id);

        let mut up_step = step(StepKind::UploadArtifact);
        up_step.artifact = Some(upload_def("dist", &["bin/**/*.dll"]));
        let result = UploadArtifactExecutor::new(Logger::disabled(), Arc::clone(&store))
            .execute(&up_step, &ctx)
            .await;
        assert!(result.success, "{}", result.stderr);
        assert!(result.stdout.contains("2 file(s)"));

        let mut down_step = step(StepKind::DownloadArtifact);
        let mut def = upload_def("dist", &[]);
        def.operation = ArtifactOperation::Download;
        def.target_path = Some("out".into());
        down_step.artifact = Some(def);
        let result = DownloadArtifactExecutor::new(Logger::disabled(), store)
            .execute(&down_step, &ctx)
            .await;
        assert!(result.success, "{}", result.stderr);
        assert_eq!(
            std::fs::read_to_string(ws.path().join("out/bin/a.dll")).unwrap(),
            "payload-a"
        );
        assert_eq!(
            std::fs::read_to_string(ws.path().join("out/bin/b.dll")).unwrap(),
            "payload-b"
        );
    }

    #[tokio::test]
    async fn missing_definition_fails_before_execution() {
        let ws = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let ctx = artifact_ctx(ws.path(), RunId::new());
        let result = UploadArtifactExecutor::new(Logger::disabled(), store(store_dir.path()))
            .execute(&step(StepKind::UploadArtifact), &ctx)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("no artifact definition"));
    }

    #[tokio::test]
    async fn missing_artifact_context_fails() {
        let store_dir = tempfile::tempdir().unwrap();
        let mut s = step(StepKind::UploadArtifact);
        s.artifact = Some(upload_def("dist", &["**"]));
        let ctx = context();
        let result = UploadArtifactExecutor::new(Logger::disabled(), store(store_dir.path()))
            .execute(&s, &ctx)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("artifact context"));
    }

    #[tokio::test]
    async fn operation_mismatch_is_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let ctx = artifact_ctx(ws.path(), RunId::new());
        let mut s = step(StepKind::DownloadArtifact);
        s.artifact = Some(upload_def("dist", &["**"]));
        let result = DownloadArtifactExecutor::new(Logger::disabled(), store(store_dir.path()))
            .execute(&s, &ctx)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("declared for"));
    }

    #[tokio::test]
    async fn empty_match_with_warn_succeeds() {
        let ws = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let ctx = artifact_ctx(ws.path(), RunId::new());
        let mut s = step(StepKind::UploadArtifact);
        s.artifact = Some(upload_def("dist", &["*.exe"]));
        let result = UploadArtifactExecutor::new(Logger::disabled(), store(store_dir.path()))
            .execute(&s, &ctx)
            .await;
        assert!(result.success);
        assert!(result.stdout.contains("no files matched"));
    }

    #[tokio::test]
    async fn download_of_unknown_artifact_fails() {
        let ws = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let ctx = artifact_ctx(ws.path(), RunId::new());
        let mut s = step(StepKind::DownloadArtifact);
        let mut def = upload_def("ghost", &[]);
        def.operation = ArtifactOperation::Download;
        s.artifact = Some(def);
        let result = DownloadArtifactExecutor::new(Logger::disabled(), store(store_dir.path()))
            .execute(&s, &ctx)
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("'ghost' not found"));
    }
}
