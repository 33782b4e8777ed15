//! Glob selection over a directory tree.
//!
//! Supports `**` (any depth), `*` (one path segment), `?`, `[...]`
//! classes, and `{a,b}` alternatives. An include pattern starting with
//! `!` is treated as an additional exclude. Matched paths are returned
//! relative to the resolution root so the store can preserve structure.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

use pdk_core::error::{Error, Result};

pub struct Matcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl Matcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let mut include_builder = GlobSetBuilder::new();
        let mut exclude_builder = GlobSetBuilder::new();

        for pattern in include {
            match pattern.strip_prefix('!') {
                Some(negated) => add(&mut exclude_builder, negated)?,
                None => add(&mut include_builder, pattern)?,
            }
        }
        for pattern in exclude {
            add(&mut exclude_builder, pattern.strip_prefix('!').unwrap_or(pattern))?;
        }

        Ok(Self {
            include: include_builder
                .build()
                .map_err(|e| Error::InvalidInput(format!("bad include set: {e}")))?,
            exclude: exclude_builder
                .build()
                .map_err(|e| Error::InvalidInput(format!("bad exclude set: {e}")))?,
        })
    }

    pub fn matches(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }
}

fn add(builder: &mut GlobSetBuilder, pattern: &str) -> Result<()> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::InvalidInput(format!("invalid glob '{pattern}': {e}")))?;
    builder.add(glob);
    Ok(())
}

/// Walk `root` and return every matching file path, relative to `root`,
/// sorted for determinism. An unreadable subdirectory is skipped, not
/// fatal, matching the glob contract of empty-on-failure.
pub fn select_files(root: &Path, include: &[String], exclude: &[String]) -> Result<Vec<PathBuf>> {
    let matcher = Matcher::new(include, exclude)?;
    let mut matched = Vec::new();
    walk(root, root, &matcher, &mut matched);
    matched.sort();
    Ok(matched)
}

fn walk(root: &Path, dir: &Path, matcher: &Matcher, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk(root, &path, matcher, out);
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                if matcher.matches(relative) {
                    out.push(relative.to_path_buf());
                }
            }
        }
    }
}
