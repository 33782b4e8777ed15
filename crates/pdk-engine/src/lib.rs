//! The PDK execution engine.
//!
//! Consumes a validated pipeline model plus a configuration and
//! reproduces cloud-CI behavior locally: backend selection, job-scoped
//! sandboxes, ordered step execution with fail-fast, artifact handoff,
//! filtering, dry-run planning, and the watch loop.

pub mod dryrun;
pub mod filter;
pub mod orchestrator;
pub mod watch;

pub use dryrun::{DryRunReport, ExecutionPlan};
pub use filter::{StepFilter, Verdict};
pub use orchestrator::{Engine, EngineOptions, RunEvent};
pub use watch::{WatchOptions, WatchSummary};
