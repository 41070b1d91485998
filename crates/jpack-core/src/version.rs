use chrono::{DateTime, Utc};

mod git;

pub use git::{GeneratedVersion, GitVersion};

pub const SNAPSHOT_MARKER: &str = "-SNAPSHOT";

/// UTC `YYYYMMDD.HHMMSS`, so later builds compare greater.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d.%H%M%S";

/// Rewrites snapshot versions into timestamped release identifiers.
///
/// The timestamp is taken once, when the normalizer is created, so every
/// version normalized by the same instance gets the same suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNormalizer {
    stamp: String,
}

impl VersionNormalizer {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            stamp: instant.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn is_snapshot(version: &str) -> bool {
        version.ends_with(SNAPSHOT_MARKER)
    }

    pub fn normalize(&self, version: &str) -> String {
        match version.strip_suffix(SNAPSHOT_MARKER) {
            Some(base) => format!("{base}-{}", self.stamp),
            None => version.to_string(),
        }
    }
}

impl Default for VersionNormalizer {
    fn default() -> Self {
        Self::new()
    }
}
