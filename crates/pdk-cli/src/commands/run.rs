//! Local pipeline execution command.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pdk_artifacts::ArtifactStore;
use pdk_config::secrets::SecretStore;
use pdk_config::{Backend, Configuration, SecretMasker, VariableResolver};
use pdk_core::cancel::CancelSource;
use pdk_core::pipeline::Pipeline;
use pdk_engine::filter::Verdict;
use pdk_engine::orchestrator::{Engine, EngineOptions, RunEvent};
use pdk_engine::watch::{WatchOptions, watch_loop};
use pdk_engine::{StepFilter, dryrun};
use pdk_executor::steps::ExecutorRegistry;
use pdk_logging::{Logger, LoggerBuilder, LogLevel};

use super::{EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_OK};
use crate::RunArgs;

pub async fn run(args: RunArgs) -> Result<i32> {
    let config = load_configuration(args.config.as_deref())?;

    // Secrets come from the encrypted store (names listed in the
    // config), PDK_SECRET_* environment entries, and --secret flags.
    let masker = Arc::new(SecretMasker::new());
    let mut resolver = VariableResolver::new(
        config.variables.clone(),
        parse_pairs(&args.vars).context("parsing --var")?,
    );
    if let Some(var_file) = &args.var_file {
        let content = std::fs::read_to_string(var_file)
            .with_context(|| format!("reading {}", var_file.display()))?;
        let map: BTreeMap<String, String> =
            serde_json::from_str(&content).context("parsing --var-file")?;
        for (k, v) in map {
            resolver.set_override(k, v);
        }
    }
    if !config.secrets.is_empty() {
        let store = SecretStore::open_default()
            .map_err(|e| anyhow::anyhow!("opening secret store: {e}"))?;
        for name in &config.secrets {
            match store.get(name) {
                Some(value) => resolver.set_secret(name.clone(), value.to_string()),
                None => eprintln!("warning: secret '{name}' not present in the secret store"),
            }
        }
    }
    for (k, v) in parse_pairs(&args.secrets).context("parsing --secret")? {
        resolver.set_secret(k, v);
    }
    masker.register_all(resolver.secret_values());

    let logger = build_logger(&args, &config, Arc::clone(&masker));

    let pipeline = load_pipeline(&args.file)?;
    let filter = build_filter(&args, &config).map_err(|e| anyhow::anyhow!(e))?;

    let workspace = args
        .file
        .parent()
        .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("resolving the workspace directory")?;

    if args.preview_filter {
        print_filter_preview(&pipeline, &filter);
    }

    let backend = if args.host { Backend::Host } else { config.runner.backend };
    let store = Arc::new(ArtifactStore::new(
        resolve_artifact_root(&config, &workspace),
        config.artifacts.retention_days,
        config.artifacts.min_free_disk_mb,
    ));

    if args.dry_run {
        return dry_run(&args, &pipeline, &resolver, backend, &filter, &logger, &store);
    }

    if args.confirm && !confirm_dispatch()? {
        println!("aborted.");
        return Ok(EXIT_FAILURE);
    }

    let mut options = EngineOptions::from_configuration(&config, workspace.clone());
    options.backend = backend;
    options.keep_containers = args.keep_containers;

    let engine = Arc::new(Engine::new(
        options,
        logger,
        masker,
        store,
        resolver,
    ));

    // One cancel source serves the whole process; Ctrl-C trips it.
    let cancel = Arc::new(CancelSource::new());
    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
                cancel.cancel();
            }
        });
    }

    if args.watch {
        let summary = run_watched(&args, &engine, &pipeline, &filter, &cancel, &workspace).await?;
        println!(
            "\nwatch summary: {} run(s), {} succeeded, {} failed, {:?} elapsed",
            summary.runs, summary.successes, summary.failures, summary.wall_time
        );
        return Ok(if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
            EXIT_INTERRUPTED
        } else {
            EXIT_OK
        });
    }

    let success = execute_once(&engine, pipeline, filter, &cancel).await?;
    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
        Ok(EXIT_INTERRUPTED)
    } else if success {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_FAILURE)
    }
}

fn load_configuration(path: Option<&Path>) -> Result<Configuration> {
    match path {
        Some(path) => {
            Configuration::load(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Ok(Configuration::default()),
    }
}

fn load_pipeline(path: &Path) -> Result<Pipeline> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline file {}", path.display()))?;
    let pipeline: Pipeline = serde_json::from_str(&content)
        .with_context(|| format!("parsing pipeline model {}", path.display()))?;
    pipeline
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid pipeline: {e}"))?;
    Ok(pipeline)
}

fn build_logger(args: &RunArgs, config: &Configuration, masker: Arc<SecretMasker>) -> Logger {
    let level = if args.silent {
        LogLevel::Error
    } else if args.quiet {
        LogLevel::Warning
    } else if args.trace {
        LogLevel::Trace
    } else if args.verbose {
        LogLevel::Debug
    } else {
        config
            .logging
            .level
            .parse()
            .unwrap_or(LogLevel::Information)
    };

    let mut builder = LoggerBuilder::new(masker).minimum(level).console();
    let file = args.log_file.clone().or_else(|| config.logging.file.clone());
    if let Some(file) = file {
        builder = builder.file(
            pdk_config::model::expand_home(&file),
            config.logging.max_file_bytes,
            config.logging.retained_files,
        );
    }
    let json = args.log_json.clone().or_else(|| config.logging.json_file.clone());
    if let Some(json) = json {
        builder = builder.json_file(pdk_config::model::expand_home(&json));
    }
    if args.no_redact {
        builder = builder.no_redact();
    }
    builder.build()
}

fn build_filter(args: &RunArgs, config: &Configuration) -> Result<StepFilter, String> {
    let mut filter = StepFilter::new().with_include_dependencies(args.include_dependencies);

    // A preset named "default" seeds the filter; flags add to it.
    if let Some(preset) = config.step_filtering.get("default") {
        for name in &preset.steps {
            filter = filter.include_name(name);
        }
        for name in &preset.skip_steps {
            filter = filter.skip_name(name);
        }
        for name in &preset.jobs {
            filter = filter.include_job(name);
        }
    }

    for name in &args.steps {
        filter = filter.include_name(name);
    }
    if let Some(spec) = &args.step_index {
        filter = filter.include_index_spec(spec).map_err(|e| e.to_string())?;
    }
    if let Some(spec) = &args.step_range {
        filter = filter.include_name_range(spec).map_err(|e| e.to_string())?;
    }
    for name in &args.skip_steps {
        filter = filter.skip_name(name);
    }
    for name in &args.jobs {
        filter = filter.include_job(name);
    }
    Ok(filter)
}

fn resolve_artifact_root(config: &Configuration, workspace: &Path) -> PathBuf {
    let root = config.artifact_root();
    if root.is_absolute() {
        root
    } else {
        workspace.join(root)
    }
}

fn print_filter_preview(pipeline: &Pipeline, filter: &StepFilter) {
    println!("filter preview:");
    for job in filter.preview(pipeline) {
        println!("  job {}", job.job_id);
        for step in job.steps {
            let (mark, reason) = match &step.verdict {
                Verdict::Included => ("+", "included".to_string()),
                Verdict::FilteredOut(reason) => ("-", reason.clone()),
                Verdict::DependencyDropped(reason) => ("!", format!("dropped dependency: {reason}")),
            };
            println!("    {mark} {} ({reason})", step.step_name);
        }
    }
}

fn confirm_dispatch() -> Result<bool> {
    use std::io::Write;
    print!("run this pipeline? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[allow(clippy::too_many_arguments)]
fn dry_run(
    args: &RunArgs,
    pipeline: &Pipeline,
    resolver: &VariableResolver,
    backend: Backend,
    filter: &StepFilter,
    logger: &Logger,
    store: &Arc<ArtifactStore>,
) -> Result<i32> {
    let registry = ExecutorRegistry::standard(logger.clone(), Arc::clone(store));
    let kinds: HashSet<String> = registry.kinds().map(String::from).collect();
    let report = dryrun::dry_run(pipeline, resolver, backend, &kinds, filter);

    println!("execution plan for '{}':", report.plan.pipeline);
    for job in &report.plan.jobs {
        println!("  job {} [{}] image={}", job.id, job.runner, job.image);
        for step in &job.steps {
            let skip = step
                .skipped
                .as_deref()
                .map(|r| format!("  (skipped: {r})"))
                .unwrap_or_default();
            println!("    {} -> {}{}", step.name, step.executor, skip);
        }
    }

    if let Some(path) = &args.dry_run_json {
        let json = serde_json::to_string_pretty(&report.plan)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("plan written to {}", path.display());
    }

    if report.ok() {
        println!("\nvalidation passed.");
        Ok(EXIT_OK)
    } else {
        eprintln!("\nvalidation failed:");
        for error in &report.errors {
            eprintln!("  ✗ {error}");
        }
        Ok(EXIT_FAILURE)
    }
}

async fn execute_once(
    engine: &Arc<Engine>,
    pipeline: Pipeline,
    filter: StepFilter,
    cancel: &Arc<CancelSource>,
) -> Result<bool> {
    let (mut rx, handle) = engine.run(pipeline, filter, cancel.token());

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::RunStarted { run_id, pipeline } => {
                println!("▶ run {run_id} for pipeline '{pipeline}'");
            }
            RunEvent::JobStarted { job } => println!("▶ job '{job}' started"),
            RunEvent::StepStarted { job, step } => println!("  ▷ [{job}] step '{step}'"),
            RunEvent::StepFinished { job, step, success, exit_code } => {
                if success {
                    println!("  ✓ [{job}] step '{step}'");
                } else {
                    println!("  ✗ [{job}] step '{step}' (exit {exit_code})");
                }
            }
            RunEvent::StepSkipped { job, step, reason } => {
                println!("  ⊘ [{job}] step '{step}' skipped: {reason}");
            }
            RunEvent::JobFinished { job, success } => {
                if success {
                    println!("✓ job '{job}' completed\n");
                } else {
                    println!("✗ job '{job}' failed\n");
                }
            }
            RunEvent::RunFinished { success } => {
                if success {
                    println!("--- pipeline succeeded ---");
                } else {
                    println!("--- pipeline failed ---");
                }
            }
        }
    }

    let result = handle.await.context("run task failed")?;
    match result {
        Ok(result) => Ok(result.success),
        Err(e) => {
            let diagnostic = pdk_core::Diagnostic::new(e);
            eprintln!("{}", diagnostic.render());
            Ok(false)
        }
    }
}

async fn run_watched(
    args: &RunArgs,
    engine: &Arc<Engine>,
    pipeline: &Pipeline,
    filter: &StepFilter,
    cancel: &Arc<CancelSource>,
    workspace: &Path,
) -> Result<pdk_engine::WatchSummary> {
    let mut roots = vec![workspace.to_path_buf()];
    if let Ok(file) = args.file.canonicalize() {
        if !file.starts_with(workspace) {
            roots.push(file);
        }
    }
    let options = WatchOptions {
        roots,
        debounce: std::time::Duration::from_millis(args.watch_debounce),
        extra_excludes: vec![],
    };

    println!("watching for changes (Ctrl-C to stop)...");
    let clear = args.watch_clear;
    let engine = Arc::clone(engine);
    let cancel_token = cancel.token();
    let summary = watch_loop(options, cancel.token(), move |paths| {
        let engine = Arc::clone(&engine);
        let pipeline = pipeline.clone();
        let filter = filter.clone();
        let cancel = cancel_token.clone();
        async move {
            if clear {
                let _ = console::Term::stdout().clear_screen();
            }
            println!("change detected ({} path(s)), re-running...", paths.len());
            let (mut rx, handle) = engine.run(pipeline, filter, cancel);
            while rx.recv().await.is_some() {}
            matches!(handle.await, Ok(Ok(result)) if result.success)
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(summary)
}

fn parse_pairs(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("'{pair}' is not KEY=VALUE"))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}
