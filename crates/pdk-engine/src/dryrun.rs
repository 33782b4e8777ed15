//! Dry-run validation and execution planning.
//!
//! Validates a pipeline against a configuration without invoking any
//! executor or allocating any sandbox, accumulating every problem instead
//! of failing on the first, and emits the execution plan a normal run
//! would follow.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use pdk_config::{Backend, VariableResolver};
use pdk_core::image::resolve_image;
use pdk_core::pipeline::{Pipeline, Step, StepKind};

use crate::filter::{StepFilter, Verdict};

/// `with` keys that must be present per step kind. Kind-conditional
/// requirements (docker tag/run inputs) are checked separately.
fn required_inputs(kind: &StepKind) -> &'static [&'static str] {
    match kind {
        StepKind::Dotnet | StepKind::Docker => &["command"],
        _ => &[],
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub pipeline: String,
    pub jobs: Vec<JobPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlan {
    pub id: String,
    pub name: String,
    pub runner: String,
    /// Mapped image, or `host` for the host backend.
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub executor: String,
    pub working_dir: Option<String>,
    pub shell: Option<String>,
    pub inputs: BTreeMap<String, String>,
    pub condition: Option<String>,
    pub skipped: Option<String>,
}

#[derive(Debug)]
pub struct DryRunReport {
    pub plan: ExecutionPlan,
    /// Rendered diagnostics; empty means the pipeline would run.
    pub errors: Vec<String>,
}

impl DryRunReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate and plan. `known_kinds` comes from the registry that would
/// dispatch the run, so the check can never drift from execution.
pub fn dry_run(
    pipeline: &Pipeline,
    resolver: &VariableResolver,
    backend: Backend,
    known_kinds: &HashSet<String>,
    filter: &StepFilter,
) -> DryRunReport {
    let mut errors = Vec::new();
    let mut jobs = Vec::new();

    if let Err(e) = pipeline.validate() {
        errors.push(e.to_string());
    }
    check_dependency_cycles(pipeline, &mut errors);

    for job in &pipeline.jobs {
        let image = if backend == Backend::Host {
            "host".to_string()
        } else {
            match resolve_image(&job.runs_on) {
                Ok(image) => image,
                Err(e) => {
                    errors.push(format!("job '{}': {e}", job.id));
                    job.runs_on.clone()
                }
            }
        };

        let mut resolver = resolver.clone();
        for (k, v) in &pipeline.variables {
            resolver.set_config(k.clone(), v.clone());
        }
        resolver.set_builtin("PDK_JOB", job.id.clone());
        resolver.set_builtin("PDK_RUNNER", job.runs_on.clone());
        resolver.set_builtin("PDK_WORKSPACE", "/workspace".to_string());

        let mut env = BTreeMap::new();
        for (k, v) in pipeline.env.iter().chain(job.env.iter()) {
            match resolver.expand(v) {
                Ok(expansion) => {
                    env.insert(k.clone(), expansion.value);
                }
                Err(e) => errors.push(format!("job '{}', env '{k}': {e}", job.id)),
            }
        }

        let verdicts = filter.verdicts(job);
        let mut steps = Vec::new();
        for (index, step) in job.steps.iter().enumerate() {
            resolver.set_builtin("PDK_STEP", step.display_name().to_string());
            steps.push(plan_step(
                job.id.as_str(),
                step,
                &verdicts[index],
                &resolver,
                known_kinds,
                &mut errors,
            ));
        }

        jobs.push(JobPlan {
            id: job.id.clone(),
            name: job.display_name().to_string(),
            runner: job.runs_on.clone(),
            image,
            env,
            steps,
        });
    }

    DryRunReport {
        plan: ExecutionPlan {
            pipeline: pipeline.name.clone(),
            jobs,
        },
        errors,
    }
}

fn plan_step(
    job_id: &str,
    step: &Step,
    verdict: &Verdict,
    resolver: &VariableResolver,
    known_kinds: &HashSet<String>,
    errors: &mut Vec<String>,
) -> StepPlan {
    let kind_key = step.kind.key();
    let location = format!("job '{job_id}', step '{}'", step.display_name());

    if !known_kinds.contains(&kind_key) {
        errors.push(format!(
            "{location}: no executor registered for kind '{kind_key}'"
        ));
    }

    for key in required_inputs(&step.kind) {
        if !step.with.contains_key(*key) {
            errors.push(format!("{location}: required input '{key}' is missing"));
        }
    }
    if step.kind == StepKind::Script && step.script.is_none() {
        errors.push(format!("{location}: required input 'script' is missing"));
    }
    if matches!(step.kind, StepKind::UploadArtifact | StepKind::DownloadArtifact) {
        match &step.artifact {
            None => errors.push(format!("{location}: step has no artifact definition")),
            Some(artifact) => {
                if let Err(e) = artifact.validate() {
                    errors.push(format!("{location}: {e}"));
                }
            }
        }
    }

    // Expansion errors surface here so a normal run never trips on them.
    let expand = |raw: &str, what: &str, errors: &mut Vec<String>| -> String {
        match resolver.expand(raw) {
            Ok(expansion) => expansion.value,
            Err(e) => {
                errors.push(format!("{location}, {what}: {e}"));
                raw.to_string()
            }
        }
    };

    if let Some(script) = &step.script {
        let _ = expand(script, "script", errors);
    }
    let mut inputs = BTreeMap::new();
    for (k, v) in &step.with {
        inputs.insert(k.clone(), expand(v, &format!("with.{k}"), errors));
    }
    for (k, v) in &step.env {
        let _ = expand(v, &format!("env.{k}"), errors);
    }
    let working_dir = step
        .working_dir
        .as_deref()
        .map(|w| expand(w, "working_dir", errors));

    StepPlan {
        id: step.id.clone(),
        name: step.display_name().to_string(),
        kind: kind_key.clone(),
        executor: kind_key,
        working_dir,
        shell: step.shell.map(|s| s.program().to_string()),
        inputs,
        condition: step.condition.clone(),
        skipped: match verdict {
            Verdict::Included => None,
            Verdict::FilteredOut(reason) | Verdict::DependencyDropped(reason) => {
                Some(reason.clone())
            }
        },
    }
}

/// Depth-first cycle check over job `needs`.
fn check_dependency_cycles(pipeline: &Pipeline, errors: &mut Vec<String>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: &str,
        jobs: &HashMap<&str, &pdk_core::pipeline::Job>,
        marks: &mut HashMap<String, Mark>,
        errors: &mut Vec<String>,
    ) {
        match marks.get(id) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                errors.push(format!("job dependency cycle involving '{id}'"));
                return;
            }
            None => {}
        }
        marks.insert(id.to_string(), Mark::Visiting);
        if let Some(job) = jobs.get(id) {
            for dep in &job.needs {
                visit(dep, jobs, marks, errors);
            }
        }
        marks.insert(id.to_string(), Mark::Done);
    }

    let jobs: HashMap<&str, &pdk_core::pipeline::Job> =
        pipeline.jobs.iter().map(|j| (j.id.as_str(), j)).collect();
    let mut marks = HashMap::new();
    for job in &pipeline.jobs {
        visit(&job.id, &jobs, &mut marks, errors);
    }
}
