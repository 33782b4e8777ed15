//! Job orchestration.
//!
//! Runs jobs in `needs`-respecting order, one sandbox per job, steps in
//! declaration order (or bounded-parallel when enabled), with fail-fast,
//! per-job timeouts, and cleanup on every exit path. Progress is emitted
//! over an event channel consumed by the CLI, in the same shape the
//! result-handle pattern uses throughout.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use pdk_artifacts::ArtifactStore;
use pdk_config::{Backend, Configuration, Fallback, SecretMasker, VariableResolver};
use pdk_core::cancel::{CancelSource, CancelToken};
use pdk_core::context::{ArtifactContext, ExecutionContext, JobMetadata};
use pdk_core::error::{Error, Result};
use pdk_core::image::resolve_image;
use pdk_core::pipeline::{Job, Pipeline};
use pdk_core::result::{JobResult, PipelineResult, StepResult};
use pdk_core::sandbox::{Sandbox, SandboxProvider, SandboxSpec};
use pdk_core::{Diagnostic, RunId};
use pdk_executor::steps::ExecutorRegistry;
use pdk_executor::{DockerProvider, HostProvider, docker};
use pdk_logging::{Logger, new_correlation_id, with_scope};

use crate::filter::{StepFilter, Verdict};

const SOURCE: &str = "orchestrator";

/// Knobs the CLI resolves from configuration + flags.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub backend: Backend,
    pub fallback: Fallback,
    /// Warn when `auto` falls back to the host.
    pub host_warnings: bool,
    /// Leave containers behind for debugging.
    pub keep_containers: bool,
    pub parallel_steps: bool,
    pub max_parallelism: usize,
    /// Project directory mounted as the workspace.
    pub workspace: PathBuf,
    pub memory_bytes: Option<i64>,
    pub cpus: Option<f64>,
    pub network: Option<String>,
}

impl EngineOptions {
    pub fn from_configuration(config: &Configuration, workspace: PathBuf) -> Self {
        Self {
            backend: config.runner.backend,
            fallback: config.runner.fallback,
            host_warnings: config.runner.host_warnings.unwrap_or(true),
            keep_containers: false,
            parallel_steps: config.performance.parallel_steps,
            max_parallelism: config.performance.max_parallelism,
            workspace,
            memory_bytes: config.docker.memory_bytes(),
            cpus: config.docker.cpu_limit,
            network: config.docker.network.clone(),
        }
    }
}

/// Progress events, emitted in order per job.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { run_id: RunId, pipeline: String },
    JobStarted { job: String },
    StepStarted { job: String, step: String },
    StepFinished { job: String, step: String, success: bool, exit_code: i32 },
    StepSkipped { job: String, step: String, reason: String },
    JobFinished { job: String, success: bool },
    RunFinished { success: bool },
}

pub struct Engine {
    options: EngineOptions,
    logger: Logger,
    masker: Arc<SecretMasker>,
    store: Arc<ArtifactStore>,
    resolver: VariableResolver,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        logger: Logger,
        masker: Arc<SecretMasker>,
        store: Arc<ArtifactStore>,
        resolver: VariableResolver,
    ) -> Self {
        Self {
            options,
            logger,
            masker,
            store,
            resolver,
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// The masker shared with the logger; new secrets discovered mid-run
    /// (secret store reads) register here.
    pub fn masker(&self) -> &Arc<SecretMasker> {
        &self.masker
    }

    /// Execute a pipeline. Returns the event stream and a handle to the
    /// final result, the way the scheduler hands out progress elsewhere.
    pub fn run(
        self: &Arc<Self>,
        pipeline: Pipeline,
        filter: StepFilter,
        cancel: CancelToken,
    ) -> (mpsc::Receiver<RunEvent>, tokio::task::JoinHandle<Result<PipelineResult>>) {
        let (tx, rx) = mpsc::channel(256);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let run_id = RunId::new();
            let correlation = new_correlation_id();
            with_scope(correlation, engine.run_inner(run_id, pipeline, filter, cancel, tx)).await
        });
        (rx, handle)
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        pipeline: Pipeline,
        filter: StepFilter,
        cancel: CancelToken,
        tx: mpsc::Sender<RunEvent>,
    ) -> Result<PipelineResult> {
        let started = Utc::now();
        pipeline.validate()?;

        // Startup retention sweep; failure is not fatal to the run.
        match self.store.sweep() {
            Ok(stats) if stats.runs_removed > 0 => self.logger.info(
                SOURCE,
                "retention sweep removed expired artifacts",
                &[
                    ("runs", stats.runs_removed.to_string()),
                    ("bytes", stats.bytes_freed.to_string()),
                ],
            ),
            Ok(_) => {}
            Err(e) => self.logger.warning(SOURCE, "retention sweep failed", &[("error", e.to_string())]),
        }

        let _ = tx
            .send(RunEvent::RunStarted {
                run_id,
                pipeline: pipeline.name.clone(),
            })
            .await;
        self.logger.info(
            SOURCE,
            "pipeline run starting",
            &[("pipeline", pipeline.name.clone()), ("run", run_id.to_string())],
        );

        let provider = self.choose_provider().await?;
        let registry = Arc::new(ExecutorRegistry::standard(
            self.logger.clone(),
            Arc::clone(&self.store),
        ));

        let order = job_order(&pipeline);
        let mut results: Vec<JobResult> = Vec::with_capacity(order.len());
        let mut outcomes: HashMap<String, bool> = HashMap::new();

        for job_id in order {
            let job = pipeline.job(&job_id).expect("ordered ids come from the pipeline");

            let failed_deps: Vec<&str> = job
                .needs
                .iter()
                .filter(|d| !outcomes.get(d.as_str()).copied().unwrap_or(false))
                .map(String::as_str)
                .collect();
            if !failed_deps.is_empty() {
                let message = format!("dependencies failed: {}", failed_deps.join(", "));
                self.logger.warning(SOURCE, "skipping job", &[
                    ("job", job.id.clone()),
                    ("reason", message.clone()),
                ]);
                outcomes.insert(job.id.clone(), false);
                results.push(JobResult::new(job.display_name(), false, vec![], Utc::now(), Some(message)));
                continue;
            }

            if cancel.is_cancelled() {
                results.push(JobResult::new(
                    job.display_name(),
                    false,
                    vec![],
                    Utc::now(),
                    Some(Error::Cancelled.to_string()),
                ));
                outcomes.insert(job.id.clone(), false);
                continue;
            }

            let _ = tx.send(RunEvent::JobStarted { job: job.id.clone() }).await;
            let result = self
                .run_job(run_id, &pipeline, job, provider.as_ref(), &registry, &filter, &cancel, &tx)
                .await;
            let _ = tx
                .send(RunEvent::JobFinished {
                    job: job.id.clone(),
                    success: result.success,
                })
                .await;
            outcomes.insert(job.id.clone(), result.success);
            results.push(result);
        }

        let result = PipelineResult::new(&pipeline.name, results, started);
        self.logger.info(
            SOURCE,
            if result.success { "pipeline run succeeded" } else { "pipeline run failed" },
            &[("duration_ms", result.duration.as_millis().to_string())],
        );
        let _ = tx.send(RunEvent::RunFinished { success: result.success }).await;
        Ok(result)
    }

    /// Backend selection per configuration, with fallback and warnings.
    async fn choose_provider(&self) -> Result<Arc<dyn SandboxProvider>> {
        match self.options.backend {
            Backend::Host => Ok(Arc::new(HostProvider::new())),
            Backend::Docker => match self.docker_if_available().await {
                Some(provider) => Ok(provider),
                None => {
                    if self.options.fallback == Fallback::Host {
                        self.logger.warning(
                            SOURCE,
                            "docker engine unavailable; falling back to host execution",
                            &[],
                        );
                        Ok(Arc::new(HostProvider::new()))
                    } else {
                        Err(Error::EngineUnavailable(
                            "docker backend requested and fallback is disabled".into(),
                        ))
                    }
                }
            },
            Backend::Auto => match self.docker_if_available().await {
                Some(provider) => Ok(provider),
                None => {
                    if self.options.host_warnings {
                        self.logger.warning(
                            SOURCE,
                            "docker engine unavailable; running jobs on the host",
                            &[],
                        );
                    }
                    Ok(Arc::new(HostProvider::new()))
                }
            },
        }
    }

    async fn docker_if_available(&self) -> Option<Arc<dyn SandboxProvider>> {
        match DockerProvider::new() {
            Ok(provider) => {
                if provider.is_available().await {
                    Some(Arc::new(provider))
                } else {
                    None
                }
            }
            Err(e) => {
                debug!(error = %e, "docker connect failed");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_job(
        &self,
        run_id: RunId,
        pipeline: &Pipeline,
        job: &Job,
        provider: &dyn SandboxProvider,
        registry: &Arc<ExecutorRegistry>,
        filter: &StepFilter,
        run_cancel: &CancelToken,
        tx: &mpsc::Sender<RunEvent>,
    ) -> JobResult {
        let started = Utc::now();
        let job_name = job.display_name().to_string();
        let on_host = provider.name() == "host";

        let image = if on_host {
            "host".to_string()
        } else {
            match resolve_image(&job.runs_on) {
                Ok(image) => image,
                Err(e) => {
                    let d = Diagnostic::new(e).in_job(&job_name);
                    self.logger.error(SOURCE, &d.render(), &[]);
                    return JobResult::new(job_name, false, vec![], started, Some(d.error.to_string()));
                }
            }
        };

        // Baseline environment: pipeline env over job env plus built-ins.
        // On the host the parent process environment is inherited by
        // spawn; containers only see what we bake in.
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in pipeline.env.iter().chain(job.env.iter()) {
            match self.resolver.expand(v) {
                Ok(expansion) => {
                    env.insert(k.clone(), expansion.value);
                }
                Err(e) => {
                    let d = Diagnostic::new(e).in_job(&job_name);
                    self.logger.error(SOURCE, &d.render(), &[]);
                    return JobResult::new(job_name, false, vec![], started, Some(d.error.to_string()));
                }
            }
        }

        let spec = SandboxSpec {
            name: docker::container_name(&run_id.short(), &job.id),
            image: image.clone(),
            host_workspace: self.options.workspace.clone(),
            env: env.clone(),
            memory_bytes: self.options.memory_bytes,
            cpus: self.options.cpus,
            network: self.options.network.clone(),
        };

        let sandbox: Arc<dyn Sandbox> = match provider.start(spec).await {
            Ok(sandbox) => Arc::from(sandbox),
            Err(e) => {
                let d = Diagnostic::new(e).in_job(&job_name);
                self.logger.error(SOURCE, &d.render(), &[]);
                return JobResult::new(job_name, false, vec![], started, Some(d.error.to_string()));
            }
        };

        // Job-scoped cancellation: run cancel and job timeout both feed it.
        let job_cancel = Arc::new(CancelSource::new());
        let link = {
            let run_cancel = run_cancel.clone();
            let job_cancel = Arc::clone(&job_cancel);
            tokio::spawn(async move {
                run_cancel.cancelled().await;
                job_cancel.cancel();
            })
        };

        let deadline = job.timeout.map(|t| tokio::time::Instant::now() + t);

        let steps_result = self
            .run_steps(
                run_id,
                pipeline,
                job,
                &image,
                Arc::clone(&sandbox),
                registry,
                filter,
                &env,
                deadline,
                tx,
                job_cancel,
            )
            .await;

        // Cleanup on every exit path; failures are logged and swallowed
        // so the primary outcome reaches the caller.
        if self.options.keep_containers && !on_host {
            self.logger.info(SOURCE, "keeping container for inspection", &[("id", sandbox.id().to_string())]);
        } else if let Err(e) = sandbox.remove().await {
            warn!(error = %e, "sandbox cleanup failed");
            self.logger.warning(SOURCE, "sandbox cleanup failed", &[("error", e.to_string())]);
        }
        link.abort();

        let (steps, aborted) = steps_result;
        let success = !aborted
            && steps
                .iter()
                .zip(job.steps.iter())
                .all(|(result, step)| result.success || step.effective_continue_on_error(job));
        // Synthetic skip results have no matching failure semantics to
        // re-check; zip above pairs by declaration order because results
        // are re-sorted before return.
        JobResult::new(job_name, success, steps, started, None)
    }

    /// Execute the job's steps; returns the results in declaration order
    /// plus whether the job aborted early (fail-fast or timeout).
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        run_id: RunId,
        pipeline: &Pipeline,
        job: &Job,
        image: &str,
        sandbox: Arc<dyn Sandbox>,
        registry: &Arc<ExecutorRegistry>,
        filter: &StepFilter,
        job_env: &BTreeMap<String, String>,
        deadline: Option<tokio::time::Instant>,
        tx: &mpsc::Sender<RunEvent>,
        job_cancel: Arc<CancelSource>,
    ) -> (Vec<StepResult>, bool) {
        let verdicts = filter.verdicts(job);

        if self.options.parallel_steps && job.steps.len() > 1 {
            return self
                .run_steps_parallel(
                    run_id, pipeline, job, image, sandbox, registry, &verdicts, job_env, deadline, tx,
                    job_cancel,
                )
                .await;
        }

        let mut results = Vec::with_capacity(job.steps.len());
        for (index, step) in job.steps.iter().enumerate() {
            match &verdicts[index] {
                Verdict::Included => {}
                Verdict::FilteredOut(reason) | Verdict::DependencyDropped(reason) => {
                    let _ = tx
                        .send(RunEvent::StepSkipped {
                            job: job.id.clone(),
                            step: step.display_name().to_string(),
                            reason: reason.clone(),
                        })
                        .await;
                    results.push(StepResult::skipped(step.display_name(), reason));
                    continue;
                }
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    results.push(StepResult::pre_exec_failure(
                        step.display_name(),
                        Error::Timeout(job.timeout.unwrap_or_default()),
                    ));
                    return (results, true);
                }
            }

            let _ = tx
                .send(RunEvent::StepStarted {
                    job: job.id.clone(),
                    step: step.display_name().to_string(),
                })
                .await;

            let ctx = self.step_context(
                run_id,
                pipeline,
                job,
                image,
                index,
                Arc::clone(&sandbox),
                job_env,
                job_cancel.token(),
            );

            let correlation = new_correlation_id();
            let execute = with_scope(correlation, async {
                self.logger.debug(SOURCE, "step starting", &[("step", step.display_name().to_string())]);
                let result = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, registry.execute(step, &ctx)).await {
                            Ok(result) => result,
                            Err(_) => {
                                job_cancel.cancel();
                                StepResult::pre_exec_failure(
                                    step.display_name(),
                                    Error::Timeout(job.timeout.unwrap_or_default()),
                                )
                            }
                        }
                    }
                    None => registry.execute(step, &ctx).await,
                };
                self.logger.debug(SOURCE, "step finished", &[
                    ("step", step.display_name().to_string()),
                    ("exit", result.exit_code.to_string()),
                ]);
                result
            })
            .await;

            let _ = tx
                .send(RunEvent::StepFinished {
                    job: job.id.clone(),
                    step: step.display_name().to_string(),
                    success: execute.success,
                    exit_code: execute.exit_code,
                })
                .await;

            let failed = !execute.success;
            let continue_on_error = step.effective_continue_on_error(job);
            results.push(execute);
            if failed && !continue_on_error {
                return (results, true);
            }
        }
        (results, false)
    }

    /// Bounded-parallel step execution. The neutral model carries no
    /// intra-job dependency marker, so every included step is treated as
    /// independent; completion order may differ, results are re-sorted to
    /// declaration order for reporting.
    #[allow(clippy::too_many_arguments)]
    async fn run_steps_parallel(
        &self,
        run_id: RunId,
        pipeline: &Pipeline,
        job: &Job,
        image: &str,
        sandbox: Arc<dyn Sandbox>,
        registry: &Arc<ExecutorRegistry>,
        verdicts: &[Verdict],
        job_env: &BTreeMap<String, String>,
        deadline: Option<tokio::time::Instant>,
        tx: &mpsc::Sender<RunEvent>,
        job_cancel: Arc<CancelSource>,
    ) -> (Vec<StepResult>, bool) {
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallelism.max(1)));
        let mut handles = Vec::with_capacity(job.steps.len());

        for (index, step) in job.steps.iter().enumerate() {
            match &verdicts[index] {
                Verdict::Included => {}
                Verdict::FilteredOut(reason) | Verdict::DependencyDropped(reason) => {
                    let result = StepResult::skipped(step.display_name(), reason);
                    let _ = tx
                        .send(RunEvent::StepSkipped {
                            job: job.id.clone(),
                            step: step.display_name().to_string(),
                            reason: reason.clone(),
                        })
                        .await;
                    handles.push((index, None, Some(result)));
                    continue;
                }
            }

            let ctx = self.step_context(
                run_id,
                pipeline,
                job,
                image,
                index,
                Arc::clone(&sandbox),
                job_env,
                job_cancel.token(),
            );
            let registry = Arc::clone(registry);
            let step = step.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let job_id = job.id.clone();
            let timeout = job.timeout;

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let _ = tx
                    .send(RunEvent::StepStarted {
                        job: job_id.clone(),
                        step: step.display_name().to_string(),
                    })
                    .await;
                let result = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, registry.execute(&step, &ctx)).await
                        {
                            Ok(result) => result,
                            Err(_) => StepResult::pre_exec_failure(
                                step.display_name(),
                                Error::Timeout(timeout.unwrap_or_default()),
                            ),
                        }
                    }
                    None => registry.execute(&step, &ctx).await,
                };
                let _ = tx
                    .send(RunEvent::StepFinished {
                        job: job_id,
                        step: step.display_name().to_string(),
                        success: result.success,
                        exit_code: result.exit_code,
                    })
                    .await;
                result
            });
            handles.push((index, Some(handle), None));
        }

        let mut results: Vec<Option<StepResult>> = (0..job.steps.len()).map(|_| None).collect();
        for (index, handle, ready) in handles {
            let result = match (handle, ready) {
                (Some(handle), _) => handle.await.unwrap_or_else(|e| {
                    StepResult::pre_exec_failure(
                        job.steps[index].display_name(),
                        format!("step task failed: {e}"),
                    )
                }),
                (None, Some(result)) => result,
                (None, None) => unreachable!("every slot carries a handle or a result"),
            };
            results[index] = Some(result);
        }

        let results: Vec<StepResult> = results.into_iter().flatten().collect();
        let aborted = results
            .iter()
            .zip(job.steps.iter())
            .any(|(result, step)| !result.success && !step.effective_continue_on_error(job));
        (results, aborted)
    }

    /// Build the immutable per-step context: job env overlaid with step
    /// env happens inside the executor; here we install the expander and
    /// the PDK built-ins for this step.
    #[allow(clippy::too_many_arguments)]
    fn step_context(
        &self,
        run_id: RunId,
        pipeline: &Pipeline,
        job: &Job,
        image: &str,
        step_index: usize,
        sandbox: Arc<dyn Sandbox>,
        job_env: &BTreeMap<String, String>,
        cancel: CancelToken,
    ) -> ExecutionContext {
        let step = &job.steps[step_index];
        let guest_workspace = sandbox.workspace().to_path_buf();

        let mut resolver = self.resolver.clone();
        for (k, v) in &pipeline.variables {
            resolver.set_config(k.clone(), v.clone());
        }
        resolver.set_builtin("PDK_WORKSPACE", guest_workspace.display().to_string());
        resolver.set_builtin("PDK_RUNNER", job.runs_on.clone());
        resolver.set_builtin("PDK_JOB", job.id.clone());
        resolver.set_builtin("PDK_STEP", step.display_name().to_string());

        let warn_logger = self.logger.clone();
        let expander: pdk_core::context::Expander = Arc::new(move |input: &str| {
            let expansion = resolver.expand(input)?;
            for warning in &expansion.warnings {
                warn_logger.warning("variables", warning, &[]);
            }
            Ok(expansion.value)
        });

        let mut env = job_env.clone();
        env.insert("PDK_VERSION".into(), env!("CARGO_PKG_VERSION").into());
        env.insert("PDK_WORKSPACE".into(), guest_workspace.display().to_string());
        env.insert("PDK_RUNNER".into(), job.runs_on.clone());
        env.insert("PDK_JOB".into(), job.id.clone());
        env.insert("PDK_STEP".into(), step.display_name().to_string());

        ExecutionContext {
            sandbox,
            host_workspace: self.options.workspace.clone(),
            guest_workspace: guest_workspace.clone(),
            env,
            working_dir: guest_workspace,
            job: JobMetadata {
                job_id: job.id.clone(),
                job_name: job.display_name().to_string(),
                runner: job.runs_on.clone(),
                image: image.to_string(),
            },
            artifacts: Some(ArtifactContext {
                run_id,
                job_name: job.display_name().to_string(),
                step_index,
            }),
            cancel,
            expand: expander,
        }
    }
}

/// Topological order over `needs`, depth-first; assumes
/// `Pipeline::validate` checked that references exist. Cycles are the
/// dry-run validator's job; here a cycle falls back to declaration order
/// for the affected jobs.
pub fn job_order(pipeline: &Pipeline) -> Vec<String> {
    let mut order = Vec::new();
    let mut visited: HashMap<&str, bool> = HashMap::new();
    let jobs: HashMap<&str, &Job> = pipeline.jobs.iter().map(|j| (j.id.as_str(), j)).collect();

    fn visit<'a>(
        id: &'a str,
        jobs: &HashMap<&'a str, &'a Job>,
        visited: &mut HashMap<&'a str, bool>,
        order: &mut Vec<String>,
    ) {
        if visited.get(id).copied().unwrap_or(false) {
            return;
        }
        visited.insert(id, true);
        if let Some(job) = jobs.get(id) {
            for dep in &job.needs {
                visit(dep.as_str(), jobs, visited, order);
            }
        }
        order.push(id.to_string());
    }

    for job in &pipeline.jobs {
        visit(&job.id, &jobs, &mut visited, &mut order);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(id: &str, needs: &[&str]) -> Job {
        Job {
            id: id.into(),
            name: None,
            runs_on: "ubuntu-latest".into(),
            steps: vec![],
            env: BTreeMap::new(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            continue_on_error: false,
        }
    }

    fn pipeline(jobs: Vec<Job>) -> Pipeline {
        Pipeline {
            name: "p".into(),
            jobs,
            env: BTreeMap::new(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn order_respects_needs() {
        let p = pipeline(vec![
            job("deploy", &["build"]),
            job("test", &[]),
            job("build", &["test"]),
        ]);
        let order = job_order(&p);
        let pos = |id: &str| order.iter().position(|j| j == id).unwrap();
        assert!(pos("test") < pos("build"));
        assert!(pos("build") < pos("deploy"));
    }

    #[test]
    fn order_keeps_declaration_for_independent_jobs() {
        let p = pipeline(vec![job("a", &[]), job("b", &[]), job("c", &[])]);
        assert_eq!(job_order(&p), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycles_do_not_hang() {
        let p = pipeline(vec![job("a", &["b"]), job("b", &["a"])]);
        let order = job_order(&p);
        assert_eq!(order.len(), 2);
    }
}

/// End-to-end runs against the host backend.
#[cfg(test)]
mod host_run_tests {
    use super::*;
    use pdk_core::pipeline::{Step, StepKind};
    use std::collections::BTreeMap;

    fn script_step(id: &str, body: &str) -> Step {
        Step {
            id: id.into(),
            name: None,
            kind: StepKind::Script,
            script: Some(body.into()),
            shell: None,
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            working_dir: None,
            continue_on_error: None,
            condition: None,
            artifact: None,
        }
    }

    fn host_job(id: &str, steps: Vec<Step>) -> Job {
        Job {
            id: id.into(),
            name: None,
            runs_on: "ubuntu-latest".into(),
            steps,
            env: BTreeMap::new(),
            needs: vec![],
            timeout: None,
            continue_on_error: false,
        }
    }

    fn pipeline(jobs: Vec<Job>) -> Pipeline {
        Pipeline {
            name: "e2e".into(),
            jobs,
            env: BTreeMap::new(),
            variables: BTreeMap::new(),
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        _workspace: tempfile::TempDir,
        _store_dir: tempfile::TempDir,
    }

    fn harness(resolver: VariableResolver) -> Harness {
        let workspace = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            backend: Backend::Host,
            fallback: Fallback::Host,
            host_warnings: false,
            keep_containers: false,
            parallel_steps: false,
            max_parallelism: 4,
            workspace: workspace.path().to_path_buf(),
            memory_bytes: None,
            cpus: None,
            network: None,
        };
        let engine = Arc::new(Engine::new(
            options,
            Logger::disabled(),
            Arc::new(SecretMasker::new()),
            Arc::new(ArtifactStore::new(store_dir.path(), 30, 0)),
            resolver,
        ));
        Harness {
            engine,
            _workspace: workspace,
            _store_dir: store_dir,
        }
    }

    async fn execute(harness: &Harness, pipeline: Pipeline) -> (PipelineResult, Vec<RunEvent>) {
        let (mut rx, handle) =
            harness
                .engine
                .run(pipeline, StepFilter::new(), CancelToken::never());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (handle.await.unwrap().unwrap(), events)
    }

    #[tokio::test]
    async fn simple_script_succeeds_with_output() {
        let h = harness(VariableResolver::empty());
        let p = pipeline(vec![host_job(
            "hello",
            vec![script_step("greet", "echo Hello World")],
        )]);
        let (result, events) = execute(&h, p).await;

        assert!(result.success);
        assert_eq!(result.jobs.len(), 1);
        let step = &result.jobs[0].steps[0];
        assert_eq!(step.exit_code, 0);
        assert!(step.stdout.contains("Hello World"));
        assert!(step.finished_at >= step.started_at);
        assert!(events.iter().any(|e| matches!(e, RunEvent::StepStarted { .. })));
        assert!(events.iter().any(|e| matches!(e, RunEvent::RunFinished { success: true })));
    }

    #[tokio::test]
    async fn failing_step_stops_the_job() {
        let h = harness(VariableResolver::empty());
        let p = pipeline(vec![host_job(
            "build",
            vec![
                script_step("a", "echo A"),
                script_step("fail", "exit 2"),
                script_step("b", "echo B"),
            ],
        )]);
        let (result, _) = execute(&h, p).await;

        assert!(!result.success);
        let job = &result.jobs[0];
        assert!(!job.success);
        assert_eq!(job.steps.len(), 2, "third step must not run");
        assert!(job.steps[0].success);
        assert_eq!(job.steps[1].exit_code, 2);
    }

    #[tokio::test]
    async fn continue_on_error_lets_the_job_finish() {
        let h = harness(VariableResolver::empty());
        let mut failing = script_step("fail", "exit 7");
        failing.continue_on_error = Some(true);
        let p = pipeline(vec![host_job(
            "build",
            vec![failing, script_step("after", "echo still here")],
        )]);
        let (result, _) = execute(&h, p).await;

        assert!(result.success, "continue-on-error failure is not fatal");
        assert_eq!(result.jobs[0].steps.len(), 2);
        assert!(!result.jobs[0].steps[0].success);
        assert!(result.jobs[0].steps[1].stdout.contains("still here"));
    }

    #[tokio::test]
    async fn variable_precedence_cli_wins() {
        let mut resolver = VariableResolver::empty();
        resolver.set_config("BUILD_CONFIG", "Release");
        resolver.set_override("BUILD_CONFIG", "Test");
        let h = harness(resolver);
        let p = pipeline(vec![host_job(
            "vars",
            vec![script_step("echo", "echo ${BUILD_CONFIG}")],
        )]);
        let (result, _) = execute(&h, p).await;
        assert_eq!(result.jobs[0].steps[0].stdout.trim(), "Test");
    }

    #[tokio::test]
    async fn pdk_builtins_are_visible_to_steps() {
        let h = harness(VariableResolver::empty());
        let p = pipeline(vec![host_job(
            "builtins",
            vec![script_step("echo", "echo job=${PDK_JOB} step=${PDK_STEP}")],
        )]);
        let (result, _) = execute(&h, p).await;
        let stdout = &result.jobs[0].steps[0].stdout;
        assert!(stdout.contains("job=builtins"));
        assert!(stdout.contains("step=echo"));
    }

    #[tokio::test]
    async fn empty_pipeline_succeeds_with_zero_results() {
        let h = harness(VariableResolver::empty());
        let (result, _) = execute(&h, pipeline(vec![])).await;
        assert!(result.success);
        assert!(result.jobs.is_empty());
    }

    #[tokio::test]
    async fn zero_step_job_succeeds() {
        let h = harness(VariableResolver::empty());
        let (result, _) = execute(&h, pipeline(vec![host_job("empty", vec![])])).await;
        assert!(result.success);
        assert!(result.jobs[0].steps.is_empty());
    }

    #[tokio::test]
    async fn failed_dependency_skips_downstream_job() {
        let h = harness(VariableResolver::empty());
        let mut downstream = host_job("deploy", vec![script_step("d", "echo deploying")]);
        downstream.needs = vec!["build".into()];
        let p = pipeline(vec![
            host_job("build", vec![script_step("fail", "exit 1")]),
            downstream,
        ]);
        let (result, _) = execute(&h, p).await;

        assert!(!result.success);
        assert_eq!(result.jobs.len(), 2);
        let skipped = &result.jobs[1];
        assert!(!skipped.success);
        assert!(skipped.steps.is_empty());
        assert!(skipped.error.as_deref().unwrap_or("").contains("build"));
    }

    #[tokio::test]
    async fn artifact_handoff_between_jobs() {
        use pdk_core::artifact::{
            ArtifactDefinition, ArtifactOperation, ArtifactOptions,
        };

        let h = harness(VariableResolver::empty());

        let make = script_step(
            "make",
            "mkdir -p bin/sub && echo payload-a > bin/a.dll && echo payload-b > bin/sub/b.dll",
        );
        let mut upload = script_step("upload", "");
        upload.kind = StepKind::UploadArtifact;
        upload.script = None;
        upload.artifact = Some(ArtifactDefinition {
            name: "dist".into(),
            operation: ArtifactOperation::Upload,
            include: vec!["bin/**/*.dll".into()],
            exclude: vec![],
            target_path: None,
            options: ArtifactOptions::default(),
        });

        let mut download = script_step("download", "");
        download.kind = StepKind::DownloadArtifact;
        download.script = None;
        download.artifact = Some(ArtifactDefinition {
            name: "dist".into(),
            operation: ArtifactOperation::Download,
            include: vec![],
            exclude: vec![],
            target_path: Some("out".into()),
            options: ArtifactOptions::default(),
        });
        let check = script_step("check", "cat out/bin/a.dll out/bin/sub/b.dll");

        let mut consumer = host_job("consume", vec![download, check]);
        consumer.needs = vec!["produce".into()];
        let p = pipeline(vec![host_job("produce", vec![make, upload]), consumer]);

        let (result, _) = execute(&h, p).await;
        assert!(result.success, "{:#?}", result);
        let check_result = &result.jobs[1].steps[1];
        assert!(check_result.stdout.contains("payload-a"));
        assert!(check_result.stdout.contains("payload-b"));
    }

    #[tokio::test]
    async fn filtered_steps_are_reported_as_skipped() {
        let h = harness(VariableResolver::empty());
        let p = pipeline(vec![host_job(
            "build",
            vec![script_step("one", "echo one"), script_step("two", "echo two")],
        )]);
        let filter = StepFilter::new().include_name("one");
        let (mut rx, handle) = h.engine.run(p, filter, CancelToken::never());
        let mut skipped = Vec::new();
        while let Some(event) = rx.recv().await {
            if let RunEvent::StepSkipped { step, .. } = event {
                skipped.push(step);
            }
        }
        let result = handle.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(skipped, vec!["two".to_string()]);
        // the skipped step still yields a successful synthetic result
        assert_eq!(result.jobs[0].steps.len(), 2);
        assert!(result.jobs[0].steps[1].stdout.contains("skipped"));
    }

    #[tokio::test]
    async fn job_timeout_cancels_and_reports_timeout() {
        let h = harness(VariableResolver::empty());
        let mut job = host_job("slow", vec![script_step("sleepy", "sleep 30")]);
        job.timeout = Some(std::time::Duration::from_millis(300));
        let started = std::time::Instant::now();
        let (result, _) = execute(&h, pipeline(vec![job])).await;

        assert!(!result.success);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        let step = &result.jobs[0].steps[0];
        assert!(step.stderr.contains("timed out"), "stderr: {}", step.stderr);
    }

    #[tokio::test]
    async fn run_cancellation_fails_the_run() {
        let h = harness(VariableResolver::empty());
        let p = pipeline(vec![host_job("slow", vec![script_step("sleepy", "sleep 30")])]);
        let source = CancelSource::new();
        let (mut rx, handle) = h.engine.run(p, StepFilter::new(), source.token());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        source.cancel();
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap().unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn parallel_steps_overlap_under_the_cap() {
        let workspace = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            backend: Backend::Host,
            fallback: Fallback::Host,
            host_warnings: false,
            keep_containers: false,
            parallel_steps: true,
            max_parallelism: 3,
            workspace: workspace.path().to_path_buf(),
            memory_bytes: None,
            cpus: None,
            network: None,
        };
        let engine = Arc::new(Engine::new(
            options,
            Logger::disabled(),
            Arc::new(SecretMasker::new()),
            Arc::new(ArtifactStore::new(store_dir.path(), 30, 0)),
            VariableResolver::empty(),
        ));

        let p = pipeline(vec![host_job(
            "par",
            vec![
                script_step("one", "sleep 0.5"),
                script_step("two", "sleep 0.5"),
                script_step("three", "sleep 0.5"),
            ],
        )]);
        let started = std::time::Instant::now();
        let (mut rx, handle) = engine.run(p, StepFilter::new(), CancelToken::never());
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap().unwrap();

        assert!(result.success);
        // three half-second sleeps overlapping: far under the 1.5s a
        // sequential run would need
        assert!(
            started.elapsed() < std::time::Duration::from_millis(1300),
            "took {:?}",
            started.elapsed()
        );
        // results come back in declaration order regardless of completion
        let names: Vec<&str> = result.jobs[0]
            .steps
            .iter()
            .map(|s| s.step_name.as_str())
            .collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }
}
