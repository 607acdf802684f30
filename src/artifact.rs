//! Stage artifacts: kinds, digests, and the post-pack scan.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::events::EventLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    ImageManifest,
    Image,
    OperatorManifest,
    OperatorArchive,
    Bundle,
}

/// Output of a packaging stage, recorded in the registry until it is
/// consumed by bundling or reclaimed with the job.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

impl ArtifactRecord {
    pub fn for_file(kind: ArtifactKind, path: PathBuf) -> Result<Self> {
        let sha256 = sha256_file(&path)?;
        Ok(Self { kind, path, sha256 })
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("hashing '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Find the artifact a pack step left at the top level of `dir`.
///
/// Exactly one file with the extension is expected. When tooling produces
/// more than one, the newest is chosen and a warning is published rather
/// than silently picking an arbitrary file.
pub fn find_packed_artifact(
    dir: &Path,
    extension: &str,
    events: &EventLog,
) -> Result<PathBuf, PipelineError> {
    let mut matches: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();

    match matches.len() {
        0 => Err(PipelineError::ArtifactNotProduced {
            extension: extension.to_string(),
            dir: dir.to_path_buf(),
        }),
        1 => Ok(matches.remove(0)),
        _ => {
            matches.sort_by_key(|path| {
                std::fs::metadata(path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            });
            let newest = matches.pop().expect("non-empty");
            events.status(format!(
                "Warning: {} '*.{}' artifacts found in '{}'; using newest: {}",
                matches.len() + 1,
                extension,
                dir.display(),
                newest.display()
            ));
            Ok(newest)
        }
    }
}
