//! Job and workspace registry.
//!
//! Process-wide mapping from job id to workspace, stage states and
//! per-stage artifact records. The registry is the single mutator of the
//! mapping; stage executors read it but never alter it directly. Each
//! workspace is exclusively owned by its job and guarded by a lock file
//! held for the job's lifetime, so two processes can never share one.
//!
//! There is no automatic expiry: an abandoned job leaks its workspace until
//! it is explicitly reclaimed. That matches the interactive, single-session
//! usage this registry serves.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fs2::FileExt;
use uuid::Uuid;

use crate::artifact::{ArtifactKind, ArtifactRecord};
use crate::bundle::Bundle;
use crate::charm::ConfigOption;
use crate::error::PipelineError;
use crate::events::EventLog;
use crate::runner::CancelToken;
use crate::validate::Framework;

const WORKSPACE_LOCK_FILENAME: &str = ".charmforge.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The fixed pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validate,
    ImageInit,
    ImagePack,
    OperatorInit,
    OperatorMutate,
    OperatorPack,
    Bundle,
}

impl Stage {
    /// Full pipeline order for a fresh job.
    pub const SEQUENCE: [Stage; 7] = [
        Stage::Validate,
        Stage::ImageInit,
        Stage::ImagePack,
        Stage::OperatorInit,
        Stage::OperatorMutate,
        Stage::OperatorPack,
        Stage::Bundle,
    ];

    /// Stages that must have succeeded before this one may start.
    pub fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::Validate => &[],
            Stage::ImageInit => &[Stage::Validate],
            Stage::ImagePack => &[Stage::ImageInit],
            Stage::OperatorInit => &[Stage::Validate],
            Stage::OperatorMutate => &[Stage::OperatorInit],
            Stage::OperatorPack => &[Stage::OperatorMutate],
            Stage::Bundle => &[Stage::ImagePack, Stage::OperatorPack],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Validate => "validate",
            Stage::ImageInit => "image-init",
            Stage::ImagePack => "image-pack",
            Stage::OperatorInit => "operator-init",
            Stage::OperatorMutate => "operator-mutate",
            Stage::OperatorPack => "operator-pack",
            Stage::Bundle => "bundle",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Acquired project details, set once acquisition completes.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub root: PathBuf,
    pub name: String,
    pub framework: Framework,
}

#[derive(Debug)]
struct JobEntry {
    workspace: PathBuf,
    project: Option<ProjectInfo>,
    framework: Framework,
    integrations: Vec<String>,
    options: Vec<ConfigOption>,
    stages: HashMap<Stage, StageState>,
    artifacts: HashMap<ArtifactKind, ArtifactRecord>,
    bundle: Option<Bundle>,
    events: Arc<EventLog>,
    cancel: CancelToken,
    /// Held for the job's lifetime; released when the entry is dropped.
    _lock: Option<WorkspaceLock>,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job against its freshly created workspace. Acquires the
    /// workspace lock; a second job (or process) pointed at the same path
    /// is refused.
    pub fn create(
        &self,
        job: JobId,
        workspace: PathBuf,
        framework: Framework,
        integrations: Vec<String>,
        options: Vec<ConfigOption>,
    ) -> Result<Arc<EventLog>, PipelineError> {
        let lock = WorkspaceLock::acquire(&workspace)?;
        let events = Arc::new(EventLog::new());

        let mut jobs = self.lock();
        if jobs.contains_key(&job) {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "job {job} already registered"
            )));
        }
        jobs.insert(
            job,
            JobEntry {
                workspace,
                project: None,
                framework,
                integrations,
                options,
                stages: HashMap::new(),
                artifacts: HashMap::new(),
                bundle: None,
                events: Arc::clone(&events),
                cancel: CancelToken::new(),
                _lock: Some(lock),
            },
        );
        Ok(events)
    }

    pub fn set_project(&self, job: JobId, root: PathBuf, name: String) -> Result<(), PipelineError> {
        let mut jobs = self.lock();
        let entry = entry_mut(&mut jobs, job)?;
        entry.project = Some(ProjectInfo {
            root,
            name,
            framework: entry.framework,
        });
        Ok(())
    }

    pub fn project(&self, job: JobId) -> Result<ProjectInfo, PipelineError> {
        let jobs = self.lock();
        let entry = entry_ref(&jobs, job)?;
        entry
            .project
            .clone()
            .ok_or_else(|| PipelineError::Internal(anyhow::anyhow!("job {job} has no acquired project")))
    }

    pub fn workspace(&self, job: JobId) -> Result<PathBuf, PipelineError> {
        Ok(entry_ref(&self.lock(), job)?.workspace.clone())
    }

    pub fn charm_inputs(&self, job: JobId) -> Result<(Vec<String>, Vec<ConfigOption>), PipelineError> {
        let jobs = self.lock();
        let entry = entry_ref(&jobs, job)?;
        Ok((entry.integrations.clone(), entry.options.clone()))
    }

    pub fn events(&self, job: JobId) -> Result<Arc<EventLog>, PipelineError> {
        Ok(Arc::clone(&entry_ref(&self.lock(), job)?.events))
    }

    pub fn cancel_token(&self, job: JobId) -> Result<CancelToken, PipelineError> {
        Ok(entry_ref(&self.lock(), job)?.cancel.clone())
    }

    pub fn stage_state(&self, job: JobId, stage: Stage) -> Result<StageState, PipelineError> {
        let jobs = self.lock();
        let entry = entry_ref(&jobs, job)?;
        Ok(entry.stages.get(&stage).copied().unwrap_or_default())
    }

    /// Transition a stage to `Running`. Enforces the per-job per-stage
    /// in-progress guard and the dependency preconditions; violating either
    /// is a usage error, not a pipeline failure.
    pub fn begin_stage(&self, job: JobId, stage: Stage) -> Result<(), PipelineError> {
        let mut jobs = self.lock();
        let entry = entry_mut(&mut jobs, job)?;

        if entry.stages.get(&stage) == Some(&StageState::Running) {
            return Err(PipelineError::StageBusy { job, stage });
        }
        for dependency in stage.dependencies() {
            if entry.stages.get(dependency).copied().unwrap_or_default() != StageState::Succeeded {
                return Err(PipelineError::StageNotReady {
                    stage,
                    dependency: *dependency,
                });
            }
        }

        entry.stages.insert(stage, StageState::Running);
        Ok(())
    }

    pub fn finish_stage(&self, job: JobId, stage: Stage, succeeded: bool) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(entry) = jobs.get_mut(&job) {
                let state = if succeeded {
                    StageState::Succeeded
                } else {
                    StageState::Failed
                };
                entry.stages.insert(stage, state);
            }
        }
    }

    pub fn record_artifact(&self, job: JobId, record: ArtifactRecord) -> Result<(), PipelineError> {
        let mut jobs = self.lock();
        let entry = entry_mut(&mut jobs, job)?;
        entry.artifacts.insert(record.kind, record);
        Ok(())
    }

    pub fn artifact(&self, job: JobId, kind: ArtifactKind) -> Result<ArtifactRecord, PipelineError> {
        let jobs = self.lock();
        let entry = entry_ref(&jobs, job)?;
        entry.artifacts.get(&kind).cloned().ok_or_else(|| {
            PipelineError::Internal(anyhow::anyhow!("job {job} has no {kind:?} artifact recorded"))
        })
    }

    pub fn store_bundle(&self, job: JobId, bundle: Bundle) -> Result<(), PipelineError> {
        let mut jobs = self.lock();
        let entry = entry_mut(&mut jobs, job)?;
        entry.bundle = Some(bundle);
        Ok(())
    }

    pub fn take_bundle(&self, job: JobId) -> Result<Bundle, PipelineError> {
        let mut jobs = self.lock();
        let entry = entry_mut(&mut jobs, job)?;
        entry.bundle.take().ok_or(PipelineError::NotReady { job })
    }

    /// Remove the workspace directory but keep the entry (and its event
    /// log) so subscribers can still read the terminal failure. Used when
    /// validation or acquisition fails and the tree is worthless.
    pub fn reclaim_workspace(&self, job: JobId) -> Result<(), PipelineError> {
        let mut jobs = self.lock();
        let entry = entry_mut(&mut jobs, job)?;
        // Release the lock before deleting the tree that holds it.
        entry._lock = None;
        if entry.workspace.exists() {
            fs::remove_dir_all(&entry.workspace)
                .with_context(|| format!("removing workspace '{}'", entry.workspace.display()))
                .map_err(PipelineError::Internal)?;
        }
        Ok(())
    }

    /// Drop the job entirely: bundle handle, artifacts, event log and
    /// workspace directory.
    pub fn remove(&self, job: JobId) -> Result<(), PipelineError> {
        let entry = {
            let mut jobs = self.lock();
            jobs.remove(&job).ok_or(PipelineError::UnknownJob(job))?
        };
        drop(entry._lock);
        if entry.workspace.exists() {
            fs::remove_dir_all(&entry.workspace)
                .with_context(|| format!("removing workspace '{}'", entry.workspace.display()))
                .map_err(PipelineError::Internal)?;
        }
        Ok(())
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.lock().contains_key(&job)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().expect("job registry poisoned")
    }
}

fn entry_ref<'a>(
    jobs: &'a HashMap<JobId, JobEntry>,
    job: JobId,
) -> Result<&'a JobEntry, PipelineError> {
    jobs.get(&job).ok_or(PipelineError::UnknownJob(job))
}

fn entry_mut<'a>(
    jobs: &'a mut HashMap<JobId, JobEntry>,
    job: JobId,
) -> Result<&'a mut JobEntry, PipelineError> {
    jobs.get_mut(&job).ok_or(PipelineError::UnknownJob(job))
}

/// RAII guard for exclusive workspace ownership. Do not unlink a "stale"
/// lock file while it may still be locked: a second process could recreate
/// it and acquire a separate exclusive lock, defeating mutual exclusion.
#[derive(Debug)]
struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    fn acquire(workspace: &Path) -> Result<Self, PipelineError> {
        let path = workspace.join(WORKSPACE_LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating workspace lock '{}'", path.display()))
            .map_err(PipelineError::Internal)?;

        if file.try_lock_exclusive().is_err() {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "workspace '{}' is locked by another job",
                workspace.display()
            )));
        }

        Ok(Self { _file: file, path })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
