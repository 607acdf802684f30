//! Artifact bundler.
//!
//! Combines the produced image and operator archive into one downloadable
//! zip at a unique temporary location. Entries are named by base file name
//! only. The returned handle owns the archive until released; release is
//! idempotent and also happens on drop.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::error::PipelineError;

/// Disposable handle to a finished bundle archive. The path stays valid and
/// readable until [`Bundle::release`] is invoked (or the handle is dropped).
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    released: bool,
}

impl Bundle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the archive. Calling this more than once is safe.
    pub fn release(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bundle the two artifacts. Both inputs are checked before any archive is
/// created; each call produces an independent archive, so concurrent jobs
/// never collide on temporary paths.
pub fn bundle(image_path: &Path, operator_path: &Path) -> Result<Bundle, PipelineError> {
    for input in [image_path, operator_path] {
        if !input.is_file() {
            return Err(PipelineError::SourceArtifactMissing {
                path: input.to_path_buf(),
            });
        }
    }

    write_archive(image_path, operator_path).map_err(PipelineError::Internal)
}

fn write_archive(image_path: &Path, operator_path: &Path) -> Result<Bundle> {
    let spool = tempfile::Builder::new()
        .prefix("charmforge-bundle-")
        .suffix(".zip")
        .tempfile()
        .context("creating bundle archive")?;
    let (file, path) = spool
        .keep()
        .context("persisting bundle archive")?;

    let mut writer = ZipWriter::new(file);
    for input in [image_path, operator_path] {
        let name = input
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("artifact '{}' has no usable file name", input.display()))?;
        writer
            .start_file(name, FileOptions::default())
            .with_context(|| format!("adding '{name}' to bundle"))?;
        let mut source = File::open(input)
            .with_context(|| format!("reading artifact '{}'", input.display()))?;
        io::copy(&mut source, &mut writer)
            .with_context(|| format!("copying '{name}' into bundle"))?;
    }
    writer.finish().context("finalizing bundle archive")?;

    Ok(Bundle {
        path,
        released: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn bundle_contains_exactly_the_two_base_named_entries() {
        let tmp = TempDir::new().unwrap();
        let rock = tmp.path().join("x.rock");
        let charm = tmp.path().join("nested").join("y.charm");
        fs::create_dir_all(charm.parent().unwrap()).unwrap();
        fs::write(&rock, b"R").unwrap();
        fs::write(&charm, b"C").unwrap();

        let mut handle = bundle(&rock, &charm).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(handle.path()).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);

        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["x.rock", "y.charm"]);

        let mut content = Vec::new();
        archive
            .by_name("x.rock")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"R");

        content.clear();
        archive
            .by_name("y.charm")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"C");

        let archived_path = handle.path().to_path_buf();
        handle.release();
        assert!(!archived_path.exists());
        // Second release is a no-op.
        handle.release();
    }

    #[test]
    fn missing_input_creates_no_archive() {
        let tmp = TempDir::new().unwrap();
        let charm = tmp.path().join("y.charm");
        fs::write(&charm, b"C").unwrap();

        let err = bundle(Path::new("/nonexistent.rock"), &charm).unwrap_err();
        assert!(matches!(err, PipelineError::SourceArtifactMissing { .. }));
    }

    #[test]
    fn concurrent_bundles_get_distinct_paths() {
        let tmp = TempDir::new().unwrap();
        let rock = tmp.path().join("a.rock");
        let charm = tmp.path().join("b.charm");
        fs::write(&rock, b"1").unwrap();
        fs::write(&charm, b"2").unwrap();

        let first = bundle(&rock, &charm).unwrap();
        let second = bundle(&rock, &charm).unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn drop_releases_the_archive() {
        let tmp = TempDir::new().unwrap();
        let rock = tmp.path().join("a.rock");
        let charm = tmp.path().join("b.charm");
        fs::write(&rock, b"1").unwrap();
        fs::write(&charm, b"2").unwrap();

        let handle = bundle(&rock, &charm).unwrap();
        let path = handle.path().to_path_buf();
        drop(handle);
        assert!(!path.exists());
    }
}
