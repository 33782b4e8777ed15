//! Run identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for one pipeline run.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new unique RunId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a RunId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short form used in directory names and log prefixes.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn short_form_is_twelve_chars() {
        assert_eq!(RunId::new().short().len(), 12);
    }

    #[test]
    fn round_trips_through_string() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
