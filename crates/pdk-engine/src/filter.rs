//! Step filtering.
//!
//! A filter is composed from include/skip expressions over step names
//! (fuzzy, case-insensitive), 1-based indices (`2,4` or `2-5`), a
//! name range (`Build-Test`), and job names. Skip always beats include;
//! when no include expression is present every non-skipped step runs.

use pdk_core::pipeline::{Job, Pipeline, Step, StepKind};

use pdk_core::error::{Error, Result};

/// Default maximum Levenshtein distance for fuzzy name matches.
pub const DEFAULT_FUZZY_DISTANCE: usize = 2;

/// Per-step decision with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Included,
    FilteredOut(String),
    /// Filtered out, but an included step depends on it (an artifact
    /// download whose upload would be dropped).
    DependencyDropped(String),
}

impl Verdict {
    pub fn is_included(&self) -> bool {
        matches!(self, Verdict::Included)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    include_names: Vec<String>,
    include_indices: Vec<usize>,
    include_name_range: Option<(String, String)>,
    skip_names: Vec<String>,
    skip_indices: Vec<usize>,
    include_jobs: Vec<String>,
    /// When set, steps that an included step depends on are executed
    /// even if an expression filtered them out.
    pub include_dependencies: bool,
    fuzzy_distance: usize,
}

impl StepFilter {
    pub fn new() -> Self {
        Self {
            fuzzy_distance: DEFAULT_FUZZY_DISTANCE,
            ..Self::default()
        }
    }

    pub fn include_name(mut self, name: impl Into<String>) -> Self {
        self.include_names.push(name.into());
        self
    }

    /// `2,4` or `2-5` (1-based, inclusive).
    pub fn include_index_spec(mut self, spec: &str) -> Result<Self> {
        self.include_indices.extend(parse_index_spec(spec)?);
        Ok(self)
    }

    /// `Build-Test`: from the step matching `Build` through the step
    /// matching `Test`, inclusive.
    pub fn include_name_range(mut self, spec: &str) -> Result<Self> {
        let (from, to) = spec.split_once('-').ok_or_else(|| {
            Error::InvalidInput(format!("step range '{spec}' must look like From-To"))
        })?;
        self.include_name_range = Some((from.trim().to_string(), to.trim().to_string()));
        Ok(self)
    }

    pub fn skip_name(mut self, name: impl Into<String>) -> Self {
        self.skip_names.push(name.into());
        self
    }

    pub fn skip_index_spec(mut self, spec: &str) -> Result<Self> {
        self.skip_indices.extend(parse_index_spec(spec)?);
        Ok(self)
    }

    pub fn include_job(mut self, name: impl Into<String>) -> Self {
        self.include_jobs.push(name.into());
        self
    }

    pub fn with_fuzzy_distance(mut self, distance: usize) -> Self {
        self.fuzzy_distance = distance;
        self
    }

    pub fn with_include_dependencies(mut self, on: bool) -> Self {
        self.include_dependencies = on;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include_names.is_empty()
            && self.include_indices.is_empty()
            && self.include_name_range.is_none()
            && self.skip_names.is_empty()
            && self.skip_indices.is_empty()
            && self.include_jobs.is_empty()
    }

    fn has_includes(&self) -> bool {
        !self.include_names.is_empty()
            || !self.include_indices.is_empty()
            || self.include_name_range.is_some()
    }

    fn name_matches(&self, query: &str, name: &str) -> bool {
        let query = query.to_lowercase();
        let name = name.to_lowercase();
        if name.contains(&query) {
            return true;
        }
        strsim::levenshtein(&query, &name) <= self.fuzzy_distance
    }

    fn job_selected(&self, job: &Job) -> bool {
        self.include_jobs.is_empty()
            || self
                .include_jobs
                .iter()
                .any(|q| self.name_matches(q, &job.id) || self.name_matches(q, job.display_name()))
    }

    /// Decide one step. `index` is 0-based position in the job.
    fn decide(&self, job: &Job, index: usize, step: &Step) -> Verdict {
        if !self.job_selected(job) {
            return Verdict::FilteredOut(format!("job '{}' not selected", job.id));
        }

        let position = index + 1; // expressions are 1-based
        let step_name = step.display_name();

        if self.skip_indices.contains(&position) {
            return Verdict::FilteredOut(format!("skipped by index {position}"));
        }
        if let Some(query) = self
            .skip_names
            .iter()
            .find(|q| self.name_matches(q, step_name) || self.name_matches(q, &step.id))
        {
            return Verdict::FilteredOut(format!("skipped by name '{query}'"));
        }

        if !self.has_includes() {
            return Verdict::Included;
        }

        if self.include_indices.contains(&position) {
            return Verdict::Included;
        }
        if self
            .include_names
            .iter()
            .any(|q| self.name_matches(q, step_name) || self.name_matches(q, &step.id))
        {
            return Verdict::Included;
        }
        if let Some((from, to)) = &self.include_name_range {
            if let Some((start, end)) = self.range_bounds(job, from, to) {
                if (start..=end).contains(&index) {
                    return Verdict::Included;
                }
            }
        }

        Verdict::FilteredOut("not matched by any include expression".to_string())
    }

    fn range_bounds(&self, job: &Job, from: &str, to: &str) -> Option<(usize, usize)> {
        let start = job
            .steps
            .iter()
            .position(|s| self.name_matches(from, s.display_name()) || self.name_matches(from, &s.id))?;
        let end = job
            .steps
            .iter()
            .position(|s| self.name_matches(to, s.display_name()) || self.name_matches(to, &s.id))?;
        Some((start.min(end), start.max(end)))
    }

    /// Verdicts for every step of a job, with the dependency pass
    /// applied: an upload that a surviving download needs is either
    /// marked [`Verdict::DependencyDropped`] or re-included when
    /// `include_dependencies` is set.
    pub fn verdicts(&self, job: &Job) -> Vec<Verdict> {
        let mut verdicts: Vec<Verdict> = job
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| self.decide(job, i, s))
            .collect();

        // Downloads depend on the upload of the same artifact name.
        for (i, step) in job.steps.iter().enumerate() {
            if step.kind != StepKind::DownloadArtifact || !verdicts[i].is_included() {
                continue;
            }
            let Some(wanted) = step.artifact.as_ref().map(|a| a.name.as_str()) else {
                continue;
            };
            for (j, other) in job.steps.iter().enumerate().take(i) {
                let uploads_it = other.kind == StepKind::UploadArtifact
                    && other.artifact.as_ref().is_some_and(|a| a.name == wanted);
                if uploads_it && !verdicts[j].is_included() {
                    verdicts[j] = if self.include_dependencies {
                        Verdict::Included
                    } else {
                        Verdict::DependencyDropped(format!(
                            "artifact '{wanted}' is consumed by included step '{}'",
                            step.display_name()
                        ))
                    };
                }
            }
        }
        verdicts
    }

    /// Per-job, per-step verdicts for the whole pipeline, for preview UIs
    /// and the orchestrator's pre-pass.
    pub fn preview(&self, pipeline: &Pipeline) -> Vec<JobPreview> {
        pipeline
            .jobs
            .iter()
            .map(|job| JobPreview {
                job_id: job.id.clone(),
                steps: job
                    .steps
                    .iter()
                    .zip(self.verdicts(job))
                    .map(|(step, verdict)| StepPreview {
                        step_id: step.id.clone(),
                        step_name: step.display_name().to_string(),
                        verdict,
                    })
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct JobPreview {
    pub job_id: String,
    pub steps: Vec<StepPreview>,
}

#[derive(Debug, Clone)]
pub struct StepPreview {
    pub step_id: String,
    pub step_name: String,
    pub verdict: Verdict,
}

/// Parse `2,4` / `2-5` / `3` into 1-based indices.
pub fn parse_index_spec(spec: &str) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((from, to)) = part.split_once('-') {
            let from: usize = parse_index(from)?;
            let to: usize = parse_index(to)?;
            if from > to {
                return Err(Error::InvalidInput(format!(
                    "index range '{part}' runs backwards"
                )));
            }
            indices.extend(from..=to);
        } else {
            indices.push(parse_index(part)?);
        }
    }
    Ok(indices)
}

fn parse_index(s: &str) -> Result<usize> {
    let n: usize = s
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("'{s}' is not a step index")))?;
    if n == 0 {
        return Err(Error::InvalidInput("step indices are 1-based".into()));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdk_core::artifact::{
        ArtifactDefinition, ArtifactOperation, ArtifactOptions,
    };
    use std::collections::BTreeMap;

    fn step(id: &str, name: &str) -> Step {
        Step {
            id: id.into(),
            name: Some(name.into()),
            kind: StepKind::Script,
            script: Some("true".into()),
            shell: None,
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            working_dir: None,
            continue_on_error: None,
            condition: None,
            artifact: None,
        }
    }

    fn job(steps: Vec<Step>) -> Job {
        Job {
            id: "build".into(),
            name: None,
            runs_on: "ubuntu-latest".into(),
            steps,
            env: BTreeMap::new(),
            needs: vec![],
            timeout: None,
            continue_on_error: false,
        }
    }

    fn four_step_job() -> Job {
        job(vec![
            step("s1", "Restore"),
            step("s2", "Build"),
            step("s3", "Test"),
            step("s4", "Publish"),
        ])
    }

    fn included(verdicts: &[Verdict]) -> Vec<bool> {
        verdicts.iter().map(Verdict::is_included).collect()
    }

    #[test]
    fn empty_filter_includes_everything() {
        let verdicts = StepFilter::new().verdicts(&four_step_job());
        assert_eq!(included(&verdicts), vec![true, true, true, true]);
    }

    #[test]
    fn include_by_name_limits_to_matches() {
        let filter = StepFilter::new().include_name("build");
        let verdicts = filter.verdicts(&four_step_job());
        assert_eq!(included(&verdicts), vec![false, true, false, false]);
    }

    #[test]
    fn fuzzy_name_tolerates_typos() {
        let filter = StepFilter::new().include_name("Biuld");
        let verdicts = filter.verdicts(&four_step_job());
        assert!(verdicts[1].is_included(), "Levenshtein 2 should match Build");
    }

    #[test]
    fn include_by_index_and_range() {
        let filter = StepFilter::new().include_index_spec("1,3").unwrap();
        assert_eq!(
            included(&filter.verdicts(&four_step_job())),
            vec![true, false, true, false]
        );

        let filter = StepFilter::new().include_index_spec("2-4").unwrap();
        assert_eq!(
            included(&filter.verdicts(&four_step_job())),
            vec![false, true, true, true]
        );
    }

    #[test]
    fn name_range_is_inclusive() {
        let filter = StepFilter::new().include_name_range("Build-Test").unwrap();
        assert_eq!(
            included(&filter.verdicts(&four_step_job())),
            vec![false, true, true, false]
        );
    }

    #[test]
    fn skip_beats_include() {
        let filter = StepFilter::new()
            .include_index_spec("1-4")
            .unwrap()
            .skip_name("Test");
        let verdicts = filter.verdicts(&four_step_job());
        assert_eq!(included(&verdicts), vec![true, true, false, true]);
        assert!(matches!(verdicts[2], Verdict::FilteredOut(_)));
    }

    #[test]
    fn job_filter_drops_unselected_jobs() {
        let filter = StepFilter::new().include_job("deploy");
        let verdicts = filter.verdicts(&four_step_job());
        assert_eq!(included(&verdicts), vec![false, false, false, false]);
    }

    #[test]
    fn bad_index_specs_are_rejected() {
        assert!(parse_index_spec("0").is_err());
        assert!(parse_index_spec("5-2").is_err());
        assert!(parse_index_spec("x").is_err());
        assert_eq!(parse_index_spec("2,4").unwrap(), vec![2, 4]);
        assert_eq!(parse_index_spec("2-4").unwrap(), vec![2, 3, 4]);
    }

    fn artifact_job() -> Job {
        let definition = |op: ArtifactOperation| ArtifactDefinition {
            name: "dist".into(),
            operation: op,
            include: vec!["bin/**".into()],
            exclude: vec![],
            target_path: None,
            options: ArtifactOptions::default(),
        };
        let mut upload = step("up", "Upload dist");
        upload.kind = StepKind::UploadArtifact;
        upload.artifact = Some(definition(ArtifactOperation::Upload));
        let mut download = step("down", "Download dist");
        download.kind = StepKind::DownloadArtifact;
        download.artifact = Some(definition(ArtifactOperation::Download));
        job(vec![step("s1", "Build"), upload, download])
    }

    #[test]
    fn dropped_dependency_is_flagged() {
        let filter = StepFilter::new().include_name("Download");
        let verdicts = filter.verdicts(&artifact_job());
        assert!(matches!(verdicts[1], Verdict::DependencyDropped(_)));
        assert!(verdicts[2].is_included());
    }

    #[test]
    fn include_dependencies_re_includes_the_upload() {
        let filter = StepFilter::new()
            .include_name("Download")
            .with_include_dependencies(true);
        let verdicts = filter.verdicts(&artifact_job());
        assert!(verdicts[1].is_included());
    }

    #[test]
    fn preview_covers_all_jobs() {
        let pipeline = Pipeline {
            name: "p".into(),
            jobs: vec![four_step_job()],
            env: BTreeMap::new(),
            variables: BTreeMap::new(),
        };
        let preview = StepFilter::new().include_name("Build").preview(&pipeline);
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].steps.len(), 4);
        assert!(preview[0].steps[1].verdict.is_included());
    }
}
