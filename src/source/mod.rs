//! Source acquisition.
//!
//! Two variants with one contract: materialize a project tree into an
//! isolated job workspace and derive a normalized project name. The archive
//! variant unpacks an upload; the remote variant clones a repository
//! (sparse-checkout when only a subfolder is wanted).

pub mod archive;
pub mod remote;

use std::path::PathBuf;

pub use archive::acquire_archive;
pub use remote::{acquire_remote, RemoteSource};

/// Result of an acquisition: where the project tree landed and what to call
/// the resulting packages.
#[derive(Debug, Clone)]
pub struct AcquiredSource {
    pub project_root: PathBuf,
    pub project_name: String,
}

/// Lowercase-hyphenated display/packaging name.
pub(crate) fn normalize_name(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .replace(['_', ' '], "-")
}

/// Wipe and recreate a directory so acquisition retries are idempotent.
pub(crate) fn reset_dir(dir: &std::path::Path) -> anyhow::Result<()> {
    use anyhow::Context;
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("clearing acquisition target '{}'", dir.display()))?;
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating acquisition target '{}'", dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased_and_hyphenated() {
        assert_eq!(normalize_name("My_Flask App"), "my-flask-app");
        assert_eq!(normalize_name("  spaced  "), "spaced");
        assert_eq!(normalize_name("already-fine"), "already-fine");
    }
}
