//! Configuration, variables, and secrets for PDK.
//!
//! This crate owns:
//! - The JSON configuration file model and its validation
//! - The layered variable resolver and `${VAR}` expansion grammar
//! - The secret masker applied to every output stream
//! - The encrypted on-disk secret store

pub mod masker;
pub mod model;
pub mod secrets;
pub mod variables;

pub use masker::SecretMasker;
pub use model::{Backend, Configuration, Fallback};
pub use variables::{Expansion, VariableResolver};
