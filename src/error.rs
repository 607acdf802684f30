//! Pipeline error taxonomy.
//!
//! Every stage converts tool-level failures into one of these variants before
//! a terminal status event is published; no raw internal error reaches a
//! subscriber. Variants that correspond to a known operator remediation carry
//! one via [`PipelineError::remediation`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::registry::{JobId, Stage};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The required external tool is not installed or not resolvable on
    /// PATH or in the fallback installation directory.
    #[error("command not found: '{name}' (searched PATH and '{fallback}')")]
    CommandNotFound { name: String, fallback: PathBuf },

    #[error("failed to launch '{executable}'")]
    Launch {
        executable: String,
        #[source]
        source: io::Error,
    },

    /// The stage exceeded its wall-clock budget and the child was killed.
    #[error("'{executable}' timed out after {}s (limit {}s)", .elapsed.as_secs(), .limit.as_secs())]
    TimedOut {
        executable: String,
        elapsed: Duration,
        limit: Duration,
    },

    /// The tool ran to completion and reported failure.
    #[error("'{executable}' exited with code {exit_code}")]
    CommandFailed {
        executable: String,
        args: Vec<String>,
        exit_code: i32,
    },

    /// The child was terminated externally (signal delivery, OOM kill).
    #[error("'{executable}' was terminated by the system{}", signal_suffix(.signal))]
    KilledBySystem {
        executable: String,
        signal: Option<i32>,
    },

    /// The tool exited successfully but the manifest it was expected to
    /// write is absent. A tool-contract violation, not a user error.
    #[error("'{tool}' reported success but did not produce '{}'", .path.display())]
    ManifestNotProduced { tool: String, path: PathBuf },

    /// The tool exited successfully but left no artifact with the expected
    /// extension behind.
    #[error("no '*.{extension}' artifact found in '{}' after packing", .dir.display())]
    ArtifactNotProduced { extension: String, dir: PathBuf },

    #[error("project validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("source acquisition failed: {reason}")]
    AcquisitionFailed { reason: String },

    #[error("unsupported archive format: '{filename}' (expected .zip, .tar or .tar.gz)")]
    UnsupportedFormat { filename: String },

    #[error("failed to update manifest '{}'", .path.display())]
    ManifestUpdateFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// A bundle input does not exist on disk. Checked before any archive
    /// is created.
    #[error("bundle input missing: '{}'", .path.display())]
    SourceArtifactMissing { path: PathBuf },

    #[error("duplicate config option key (keys are case-insensitive): '{key}'")]
    DuplicateOption { key: String },

    #[error("config option '{key}' is required and must not carry a default value")]
    DefaultOnRequiredOption { key: String },

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// Retrieval was requested before the job reached terminal success.
    #[error("job {job} has no finished bundle to retrieve")]
    NotReady { job: JobId },

    /// The same stage was invoked twice concurrently for one job.
    #[error("stage {stage} is already running for job {job}")]
    StageBusy { job: JobId, stage: Stage },

    /// A stage was invoked before its dependency succeeded. A usage error,
    /// not a recoverable pipeline failure.
    #[error("stage {stage} requires {dependency} to succeed first")]
    StageNotReady { stage: Stage, dependency: Stage },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Operator-facing guidance appended to the terminal failure event.
    /// The remediation differs by failure class: a timeout asks for a
    /// smaller project or more resources, a system kill points at memory
    /// pressure, a plain failure points back at the streamed log.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            PipelineError::TimedOut { .. } => Some(
                "The operation timed out. The project is likely too large or the \
                 machine is short on resources. Try reducing dependencies or \
                 running on a machine with more CPU and RAM.",
            ),
            PipelineError::KilledBySystem { .. } => Some(
                "The tool was terminated by the system. This usually means the \
                 system ran out of memory. Close other applications and try \
                 again with a simpler project.",
            ),
            PipelineError::CommandNotFound { .. } => Some(
                "Install the missing tool and make sure it is on PATH or in the \
                 fallback installation directory.",
            ),
            PipelineError::CommandFailed { .. } => {
                Some("The external tool failed. See the streamed log above for details.")
            }
            _ => None,
        }
    }

}

fn signal_suffix(signal: &Option<i32>) -> String {
    match signal {
        Some(sig) => format!(" (signal {sig})"),
        None => String::new(),
    }
}
