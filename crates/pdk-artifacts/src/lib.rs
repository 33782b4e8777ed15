//! Artifact staging between steps and jobs.
//!
//! Uploaded files are staged under a per-(run, job, step, artifact)
//! directory with a metadata record beside them; downloads locate an
//! artifact by name and materialize it into the workspace. The
//! uniqueness of the (run, job, step, artifact) tuple is the only
//! invariant guarding against concurrent writers.

pub mod glob;
pub mod meta;
pub mod store;

pub use meta::{ArtifactMetadata, FileEntry};
pub use store::{ArtifactStore, DownloadOutcome, SweepStats, UploadOutcome};
