//! Core domain types and traits for the PDK pipeline engine.
//!
//! This crate contains:
//! - The provider-neutral pipeline model (pipelines, jobs, steps)
//! - Artifact definitions and options
//! - Step/job results and the immutable execution context
//! - The sandbox contract implemented by the container and host backends
//! - Runner-image mapping
//! - Run identifiers and common error kinds

pub mod artifact;
pub mod cancel;
pub mod context;
pub mod error;
pub mod id;
pub mod image;
pub mod pipeline;
pub mod result;
pub mod sandbox;

pub use cancel::{CancelSource, CancelToken};
pub use error::{Diagnostic, Error, Result};
pub use id::RunId;
