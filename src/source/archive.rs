//! Archive-upload acquisition.
//!
//! The upload arrives as a byte stream plus its declared filename. It is
//! spooled to a temp file, dispatched to the right decompressor by
//! extension, and unpacked into the job workspace. Archive tools commonly
//! wrap the project in a redundant top-level folder; when exactly one
//! top-level directory remains after extraction, that directory becomes the
//! project root and names the project.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;
use flate2::read::GzDecoder;
use tempfile::NamedTempFile;

use crate::error::PipelineError;
use crate::source::{normalize_name, reset_dir, AcquiredSource};

/// Entries ignored when deciding whether the archive carried a single
/// wrapper directory. `__MACOSX` is metadata junk from macOS zip tools.
fn is_noise_entry(name: &str) -> bool {
    name.starts_with('.') || name == "__MACOSX"
}

pub fn acquire_archive(
    mut upload: impl Read,
    filename: &str,
    target_dir: &Path,
) -> Result<AcquiredSource, PipelineError> {
    reset_dir(target_dir)?;

    let mut spool = NamedTempFile::new()
        .context("creating upload spool file")
        .map_err(PipelineError::Internal)?;
    io::copy(&mut upload, spool.as_file_mut())
        .context("spooling upload to disk")
        .map_err(PipelineError::Internal)?;
    spool
        .as_file_mut()
        .seek(SeekFrom::Start(0))
        .context("rewinding upload spool")
        .map_err(PipelineError::Internal)?;

    extract(spool.as_file_mut(), filename, target_dir)?;

    Ok(detect_project_root(target_dir, filename)?)
}

fn extract(spool: &mut File, filename: &str, target_dir: &Path) -> Result<(), PipelineError> {
    let lower = filename.to_ascii_lowercase();

    let result = if lower.ends_with(".zip") {
        extract_zip(spool, target_dir)
    } else if lower.ends_with(".tar.gz") {
        tar::Archive::new(GzDecoder::new(spool))
            .unpack(target_dir)
            .context("unpacking .tar.gz archive")
    } else if lower.ends_with(".tar") {
        tar::Archive::new(spool)
            .unpack(target_dir)
            .context("unpacking .tar archive")
    } else {
        return Err(PipelineError::UnsupportedFormat {
            filename: filename.to_string(),
        });
    };

    result.map_err(|err| PipelineError::AcquisitionFailed {
        reason: format!("{err:#}"),
    })
}

fn extract_zip(spool: &mut File, target_dir: &Path) -> anyhow::Result<()> {
    let mut archive = zip::ZipArchive::new(spool).context("reading zip archive")?;
    archive
        .extract(target_dir)
        .context("unpacking .zip archive")?;
    Ok(())
}

/// Strip a redundant wrapper folder: with exactly one non-noise top-level
/// directory, that directory is the project root; otherwise the extraction
/// target itself is, and the project is named after the upload.
fn detect_project_root(target_dir: &Path, filename: &str) -> anyhow::Result<AcquiredSource> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(target_dir)
        .with_context(|| format!("listing extracted tree '{}'", target_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_noise_entry(&name) {
            continue;
        }
        entries.push((name, entry.path()));
    }

    if entries.len() == 1 && entries[0].1.is_dir() {
        let (name, path) = entries.remove(0);
        return Ok(AcquiredSource {
            project_root: path,
            project_name: normalize_name(&name),
        });
    }

    Ok(AcquiredSource {
        project_root: target_dir.to_path_buf(),
        project_name: normalize_name(strip_archive_suffix(filename)),
    })
}

fn strip_archive_suffix(filename: &str) -> &str {
    for suffix in [".tar.gz", ".zip", ".tar"] {
        if filename.len() > suffix.len() {
            let (stem, tail) = filename.split_at(filename.len() - suffix.len());
            if tail.eq_ignore_ascii_case(suffix) {
                return stem;
            }
        }
    }
    filename
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), FileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(content).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn single_wrapper_directory_becomes_project_root() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("job");
        let data = zip_bytes(&[
            ("My_App/", b""),
            ("My_App/requirements.txt", b"flask\n"),
            ("My_App/app.py", b"print('hi')\n"),
        ]);

        let acquired = acquire_archive(Cursor::new(data), "upload.zip", &target).unwrap();
        assert_eq!(acquired.project_root, target.join("My_App"));
        assert_eq!(acquired.project_name, "my-app");
        assert!(acquired.project_root.join("requirements.txt").is_file());
    }

    #[test]
    fn flat_archive_roots_at_target_and_names_from_filename() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("job");
        let data = zip_bytes(&[("requirements.txt", b"flask\n"), ("app.py", b"x\n")]);

        let acquired =
            acquire_archive(Cursor::new(data), "Flask_Demo.zip", &target).unwrap();
        assert_eq!(acquired.project_root, target);
        assert_eq!(acquired.project_name, "flask-demo");
    }

    #[test]
    fn tar_gz_round_trip() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("job");

        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(6);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "svc/go.mod", &b"module"[..])
            .unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let acquired = acquire_archive(Cursor::new(data), "svc.tar.gz", &target).unwrap();
        assert_eq!(acquired.project_name, "svc");
        assert!(acquired.project_root.join("go.mod").is_file());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = acquire_archive(
            Cursor::new(b"rarrar".to_vec()),
            "upload.rar",
            &tmp.path().join("job"),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat { .. }));
    }

    #[test]
    fn macosx_noise_does_not_defeat_wrapper_detection() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("job");
        let data = zip_bytes(&[
            ("__MACOSX/", b""),
            ("app/", b""),
            ("app/requirements.txt", b"flask\n"),
        ]);

        let acquired = acquire_archive(Cursor::new(data), "app.zip", &target).unwrap();
        assert_eq!(acquired.project_name, "app");
        assert_eq!(acquired.project_root, target.join("app"));
    }

    #[test]
    fn retry_overwrites_a_dirty_target() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("job");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), b"old").unwrap();

        let data = zip_bytes(&[("app.py", b"x")]);
        acquire_archive(Cursor::new(data), "app.zip", &target).unwrap();
        assert!(!target.join("stale.txt").exists());
    }
}
