//! Execution backends and step executors for PDK.
//!
//! Provides the two sandbox providers (Docker containers, host
//! subprocesses) behind the contract in `pdk_core::sandbox`, plus one
//! step executor per step kind and the registry that dispatches them.

pub mod docker;
pub mod host;
pub mod steps;

pub use docker::DockerProvider;
pub use host::HostProvider;
pub use steps::{ExecutorRegistry, StepExecutor};
