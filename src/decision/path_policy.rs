//! Application directory policy.
//!
//! When a list of allowed application directories is configured, binaries
//! launched from anywhere else are "misplaced". Misplaced binaries are
//! denied before any signature work unless misplaced applications are
//! explicitly allowed.

use std::path::{Path, PathBuf};

use crate::config::PolicyConfig;
use crate::types::normalize_path;

/// Outcome of a directory check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCheck {
    /// Whether the binary may proceed to signature verification.
    pub allowed: bool,
    /// Whether the binary lives outside every allowed directory.
    pub misplaced: bool,
}

/// Allowed directories plus the misplaced-application switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationDirectoryPolicy {
    directories: Vec<PathBuf>,
    allow_misplaced: bool,
}

impl ApplicationDirectoryPolicy {
    /// Build from explicit directories; empty entries are ignored.
    pub fn new<I, P>(directories: I, allow_misplaced: bool) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let directories = directories
            .into_iter()
            .filter(|dir| !dir.as_ref().as_os_str().is_empty())
            .map(|dir| normalize_path(dir.as_ref()))
            .collect();
        Self {
            directories,
            allow_misplaced,
        }
    }

    /// Build from the `[policy]` section.
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            &config.allowed_application_directories,
            config.allow_misplaced_applications,
        )
    }

    /// Normalized allowed directories.
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Check a binary path.
    pub fn check(&self, binary_path: &Path) -> PathCheck {
        let misplaced = !self.directories.is_empty()
            && !self
                .directories
                .iter()
                .any(|dir| binary_path.starts_with(dir));
        PathCheck {
            allowed: !misplaced || self.allow_misplaced,
            misplaced,
        }
    }
}
