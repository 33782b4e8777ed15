//! Symbolic runner name to image reference mapping.

use std::sync::LazyLock;

use crate::error::{Error, Result};

/// Fixed translation table for the symbolic runner names upstream
/// providers use.
const RUNNER_IMAGES: &[(&str, &str)] = &[
    ("ubuntu-latest", "ubuntu:22.04"),
    ("ubuntu-22.04", "ubuntu:22.04"),
    ("ubuntu-20.04", "ubuntu:20.04"),
    ("debian-latest", "debian:bookworm"),
    ("windows-latest", "mcr.microsoft.com/windows/servercore:ltsc2022"),
    ("windows-2022", "mcr.microsoft.com/windows/servercore:ltsc2022"),
];

// Loose image-reference shape: [registry/]repo[:tag][@digest]. Enough to
// reject obvious garbage at dispatch time; the engine gives the final word.
static IMAGE_REF_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-z0-9]+((\.|_{1,2}|-+|/)[a-z0-9]+)*(:[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?(@sha256:[a-f0-9]{64})?$").unwrap()
});

/// Translate a runner designation to a concrete image reference.
///
/// Anything containing `:` or `/` is treated as a literal image reference
/// and only syntax-checked; symbolic names go through the fixed table.
pub fn resolve_image(runner: &str) -> Result<String> {
    let runner = runner.trim();
    if runner.is_empty() {
        return Err(Error::InvalidInput("runner designation is empty".into()));
    }

    if runner.contains(':') || runner.contains('/') {
        if !IMAGE_REF_RE.is_match(runner) {
            return Err(Error::InvalidInput(format!(
                "'{runner}' is not a valid image reference"
            )));
        }
        return Ok(runner.to_string());
    }

    let lowered = runner.to_lowercase();
    if let Some((_, image)) = RUNNER_IMAGES.iter().find(|(name, _)| *name == lowered) {
        return Ok((*image).to_string());
    }

    Err(Error::InvalidInput(format!(
        "unknown runner '{runner}'; use a known symbolic name or a concrete image reference"
    )))
}
