//! The `pdk` binary.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "pdk")]
#[command(about = "Run cloud CI pipelines on your own machine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline locally
    Run(RunArgs),
    /// Validate a pipeline and print the execution plan (alias for
    /// `run --dry-run`)
    Validate(RunArgs),
    /// Inspect and clean the artifact store
    Artifacts {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// Manage the encrypted secret store
    Secrets {
        #[command(subcommand)]
        command: SecretCommands,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Pipeline definition: the provider-neutral model as JSON
    #[arg(long, short = 'f', default_value = "pipeline.json")]
    file: PathBuf,

    /// Configuration file (JSON)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Variable override, repeatable: --var KEY=VALUE
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// JSON file with a map of variable overrides
    #[arg(long, value_name = "PATH")]
    var_file: Option<PathBuf>,

    /// Secret override, repeatable: --secret KEY=VALUE
    #[arg(long = "secret", value_name = "KEY=VALUE")]
    secrets: Vec<String>,

    /// Re-run the pipeline when files change
    #[arg(long)]
    watch: bool,

    /// Watch debounce window in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 500)]
    watch_debounce: u64,

    /// Clear the terminal before each watched run
    #[arg(long)]
    watch_clear: bool,

    /// Validate and plan without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Write the machine-readable plan to a file
    #[arg(long, value_name = "PATH")]
    dry_run_json: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Trace-level logging
    #[arg(long)]
    trace: bool,

    /// Warnings and errors only
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Errors only
    #[arg(long)]
    silent: bool,

    /// Plain-text log file (default: ~/.pdk/logs/pdk.log when enabled
    /// via configuration)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// JSON-lines log file
    #[arg(long, value_name = "PATH")]
    log_json: Option<PathBuf>,

    /// Disable secret redaction (dangerous; loudly warned)
    #[arg(long)]
    no_redact: bool,

    /// Include steps matching this name (fuzzy), repeatable
    #[arg(long = "step", value_name = "NAME")]
    steps: Vec<String>,

    /// Include steps by 1-based index: `2,4` or `2-5`
    #[arg(long, value_name = "SPEC")]
    step_index: Option<String>,

    /// Include a named inclusive range: `Build-Test`
    #[arg(long, value_name = "FROM-TO")]
    step_range: Option<String>,

    /// Skip steps matching this name, repeatable (skip beats include)
    #[arg(long = "skip-step", value_name = "NAME")]
    skip_steps: Vec<String>,

    /// Only run the named jobs, repeatable
    #[arg(long = "job", value_name = "NAME")]
    jobs: Vec<String>,

    /// Also run filtered-out steps that included steps depend on
    #[arg(long)]
    include_dependencies: bool,

    /// Show the per-step filter verdicts before running
    #[arg(long)]
    preview_filter: bool,

    /// Ask for confirmation before dispatching
    #[arg(long)]
    confirm: bool,

    /// Force the host backend (no containers)
    #[arg(long)]
    host: bool,

    /// Do not remove job containers (debugging)
    #[arg(long)]
    keep_containers: bool,
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// List stored artifacts
    List,
    /// Delete runs past their retention
    Sweep,
}

#[derive(Subcommand)]
enum SecretCommands {
    /// Store a secret
    Set {
        name: String,
        value: String,
    },
    /// List secret names (never values)
    List,
    /// Remove a secret
    Remove {
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Internal diagnostics (RUST_LOG) go to stderr; run output has its
    // own logger with masking and sinks.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run(args) => commands::run::run(args).await?,
        Commands::Validate(mut args) => {
            args.dry_run = true;
            commands::run::run(args).await?
        }
        Commands::Artifacts { command } => match command {
            ArtifactCommands::List => commands::artifacts::list()?,
            ArtifactCommands::Sweep => commands::artifacts::sweep()?,
        },
        Commands::Secrets { command } => match command {
            SecretCommands::Set { name, value } => commands::secrets::set(&name, &value)?,
            SecretCommands::List => commands::secrets::list()?,
            SecretCommands::Remove { name } => commands::secrets::remove(&name)?,
        },
    };

    std::process::exit(exit_code);
}
