//! Artifact store inspection and cleanup.

use anyhow::Result;
use std::path::PathBuf;

use pdk_artifacts::ArtifactStore;
use pdk_config::Configuration;

use super::{EXIT_FAILURE, EXIT_OK};

fn open_store() -> ArtifactStore {
    let config = Configuration::default();
    let root: PathBuf = config.artifact_root();
    ArtifactStore::new(
        root,
        config.artifacts.retention_days,
        config.artifacts.min_free_disk_mb,
    )
}

pub fn list() -> Result<i32> {
    let store = open_store();
    let artifacts = match store.list(None) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            eprintln!("listing artifacts failed: {e}");
            return Ok(EXIT_FAILURE);
        }
    };
    if artifacts.is_empty() {
        println!("no artifacts under {}", store.root().display());
        return Ok(EXIT_OK);
    }
    for artifact in artifacts {
        println!(
            "{}  {}  job={} step={} files={} bytes={}",
            artifact.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            artifact.name,
            artifact.job,
            artifact.step,
            artifact.file_count,
            artifact.total_bytes,
        );
    }
    Ok(EXIT_OK)
}

pub fn sweep() -> Result<i32> {
    let store = open_store();
    match store.sweep() {
        Ok(stats) => {
            println!(
                "removed {} run(s), freed {} bytes",
                stats.runs_removed, stats.bytes_freed
            );
            Ok(EXIT_OK)
        }
        Err(e) => {
            eprintln!("sweep failed: {e}");
            Ok(EXIT_FAILURE)
        }
    }
}
