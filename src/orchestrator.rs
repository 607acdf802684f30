//! Pipeline orchestrator.
//!
//! Sequences the stages for one job on a dedicated thread, publishes every
//! stage transition and tool output line to the job's event log, enforces
//! the per-stage guards through the registry, and exposes cancellation,
//! single-stage re-entry and one-shot bundle retrieval.

use std::io::Read;
use std::sync::Arc;

use crate::artifact::{ArtifactKind, ArtifactRecord};
use crate::bundle;
use crate::charm::CharmPackager;
use crate::config::ForgeConfig;
use crate::error::PipelineError;
use crate::events::{EventLog, Outcome, StatusEvent};
use crate::registry::{JobId, JobRegistry, Stage};
use crate::rock::RockPackager;
use crate::runner::CommandRunner;
use crate::source::{self, RemoteSource};
use crate::validate::{self, Framework};
use crate::StageContext;

/// Where the job's source comes from.
pub enum SourceSpec {
    /// An uploaded archive: the byte stream plus its declared filename.
    Archive {
        data: Box<dyn Read + Send>,
        filename: String,
    },
    Remote(RemoteSource),
}

/// Immutable per-job input, fixed at submission.
pub struct JobRequest {
    pub source: SourceSpec,
    pub framework: Framework,
    pub integrations: Vec<String>,
    pub options: crate::charm::OptionSet,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: ForgeConfig,
    registry: Arc<JobRegistry>,
    runner: CommandRunner,
}

impl Orchestrator {
    pub fn new(config: ForgeConfig) -> Self {
        let runner = CommandRunner::new(&config.fallback_bin_dir);
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            runner,
        }
    }

    /// The registry is injected state, not an ambient global; share it with
    /// adapters that need direct reads.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Create the job and start its pipeline on a background thread.
    /// Returns as soon as the job is registered; progress streams through
    /// [`Orchestrator::events`].
    pub fn submit(&self, request: JobRequest) -> Result<JobId, PipelineError> {
        let job = JobId::new();
        let workspace = self.config.storage_root.join(job.to_string());
        std::fs::create_dir_all(&workspace)
            .map_err(|err| PipelineError::AcquisitionFailed {
                reason: format!("creating workspace '{}': {err}", workspace.display()),
            })?;

        self.registry.create(
            job,
            workspace,
            request.framework,
            request.integrations.clone(),
            request.options.as_slice().to_vec(),
        )?;

        let orchestrator = self.clone();
        std::thread::spawn(move || {
            orchestrator.run_pipeline(job, request.source);
        });

        tracing::info!(%job, "pipeline submitted");
        Ok(job)
    }

    /// All events appended at or after `since`, plus the terminal outcome
    /// once one exists.
    pub fn events(
        &self,
        job: JobId,
        since: usize,
    ) -> Result<(Vec<StatusEvent>, Option<Outcome>), PipelineError> {
        Ok(self.registry.events(job)?.since(since))
    }

    /// Kill the running stage's child process and leave later stages
    /// blocked on the failed precondition.
    pub fn cancel(&self, job: JobId) -> Result<(), PipelineError> {
        self.registry.cancel_token(job)?.cancel();
        tracing::info!(%job, "cancellation requested");
        Ok(())
    }

    /// Return the finished bundle's bytes exactly once. As a side effect
    /// releases all stage artifacts and removes the job's workspace.
    pub fn retrieve(&self, job: JobId) -> Result<Vec<u8>, PipelineError> {
        let events = self.registry.events(job)?;
        match events.outcome() {
            Some(Outcome::Success { .. }) => {}
            _ => return Err(PipelineError::NotReady { job }),
        }

        let mut bundle = self.registry.take_bundle(job)?;
        let bytes = std::fs::read(bundle.path()).map_err(|err| {
            PipelineError::Internal(anyhow::anyhow!(
                "reading bundle '{}': {err}",
                bundle.path().display()
            ))
        })?;
        bundle.release();
        self.registry.remove(job)?;
        tracing::info!(%job, "bundle retrieved and job reclaimed");
        Ok(bytes)
    }

    /// Explicitly reclaim an abandoned job: cancel whatever is running and
    /// drop the entry, its artifacts and its workspace. Without this call
    /// an abandoned job's workspace leaks by design.
    pub fn abandon(&self, job: JobId) -> Result<(), PipelineError> {
        let _ = self.cancel(job);
        self.registry.remove(job)
    }

    /// Re-invoke a single stage, provided its dependencies still hold.
    /// Lets a user edit a manifest between stages and re-run only what
    /// follows.
    pub fn run_stage(&self, job: JobId, stage: Stage) -> Result<(), PipelineError> {
        self.registry.begin_stage(job, stage)?;

        let cancel = self.registry.cancel_token(job)?;
        cancel.reset();
        let events = self.registry.events(job)?;
        let ctx = StageContext {
            config: &self.config,
            runner: &self.runner,
            cancel: &cancel,
            events: &events,
        };

        let result = self.execute_stage(job, stage, &ctx);
        self.registry.finish_stage(job, stage, result.is_ok());
        match &result {
            Ok(()) => tracing::debug!(%job, %stage, "stage succeeded"),
            Err(err) => tracing::warn!(%job, %stage, %err, "stage failed"),
        }
        result
    }

    fn execute_stage(
        &self,
        job: JobId,
        stage: Stage,
        ctx: &StageContext<'_>,
    ) -> Result<(), PipelineError> {
        match stage {
            Stage::Validate => {
                let project = self.registry.project(job)?;
                ctx.events.status(format!(
                    "Validating project '{}' for {}...",
                    project.name, project.framework
                ));
                validate::validate_project(&project.root, project.framework)?;
                ctx.events.status("Validation successful.");
                Ok(())
            }
            Stage::ImageInit => {
                let manifest = self.rock_packager(job)?.init(ctx)?;
                self.record(job, ArtifactKind::ImageManifest, manifest)
            }
            Stage::ImagePack => {
                let artifact = self.rock_packager(job)?.pack(ctx)?;
                self.record(job, ArtifactKind::Image, artifact)
            }
            Stage::OperatorInit => {
                let manifest = self.charm_packager(job)?.init(ctx)?;
                self.record(job, ArtifactKind::OperatorManifest, manifest)
            }
            Stage::OperatorMutate => self.charm_packager(job)?.mutate(ctx),
            Stage::OperatorPack => {
                let artifact = self.charm_packager(job)?.pack(ctx)?;
                self.record(job, ArtifactKind::OperatorArchive, artifact)
            }
            Stage::Bundle => {
                let image = self.registry.artifact(job, ArtifactKind::Image)?;
                let operator = self.registry.artifact(job, ArtifactKind::OperatorArchive)?;
                ctx.events.status("Bundling artifacts...");
                let bundle = bundle::bundle(&image.path, &operator.path)?;
                self.record(job, ArtifactKind::Bundle, bundle.path().to_path_buf())?;
                self.registry.store_bundle(job, bundle)
            }
        }
    }

    fn rock_packager(&self, job: JobId) -> Result<RockPackager, PipelineError> {
        let project = self.registry.project(job)?;
        Ok(RockPackager::new(
            project.root,
            project.name,
            project.framework,
        ))
    }

    fn charm_packager(&self, job: JobId) -> Result<CharmPackager, PipelineError> {
        let project = self.registry.project(job)?;
        let workspace = self.registry.workspace(job)?;
        let (integrations, options) = self.registry.charm_inputs(job)?;
        CharmPackager::new(&workspace, project.name, integrations, options)
    }

    fn record(
        &self,
        job: JobId,
        kind: ArtifactKind,
        path: std::path::PathBuf,
    ) -> Result<(), PipelineError> {
        let record = ArtifactRecord::for_file(kind, path).map_err(PipelineError::Internal)?;
        tracing::debug!(%job, ?kind, sha256 = %record.sha256, "artifact recorded");
        self.registry.record_artifact(job, record)
    }

    /// Full pipeline for a fresh job: acquisition, then every stage in
    /// sequence. Runs on the job's background thread.
    fn run_pipeline(&self, job: JobId, source: SourceSpec) {
        let events = match self.registry.events(job) {
            Ok(events) => events,
            Err(_) => return,
        };

        if let Err(err) = self.acquire(job, source, &events) {
            // A partially created workspace is worthless; reclaim it now.
            self.fail_terminal(job, &events, err, true);
            return;
        }

        for stage in Stage::SEQUENCE {
            if let Err(err) = self.run_stage(job, stage) {
                // A tree that failed validation is also reclaimed
                // immediately; packaging failures keep completed artifacts
                // on disk so the user can retry just the failed stage.
                let reclaim = stage == Stage::Validate;
                self.fail_terminal(job, &events, err, reclaim);
                return;
            }
        }

        match self.registry.artifact(job, ArtifactKind::Bundle) {
            Ok(record) => {
                tracing::info!(%job, bundle = %record.path.display(), "pipeline finished");
                events.finish(Outcome::Success {
                    bundle: record.path,
                });
            }
            Err(err) => self.fail_terminal(job, &events, err, false),
        }
    }

    fn acquire(
        &self,
        job: JobId,
        source: SourceSpec,
        events: &Arc<EventLog>,
    ) -> Result<(), PipelineError> {
        let workspace = self.registry.workspace(job)?;
        let target = workspace.join("project");
        let cancel = self.registry.cancel_token(job)?;

        events.status("Acquiring project source...");
        let acquired = match source {
            SourceSpec::Archive { data, filename } => {
                source::acquire_archive(data, &filename, &target)?
            }
            SourceSpec::Remote(remote) => {
                let ctx = StageContext {
                    config: &self.config,
                    runner: &self.runner,
                    cancel: &cancel,
                    events,
                };
                source::acquire_remote(&remote, &target, &ctx)?
            }
        };

        events.status(format!("Project '{}' acquired.", acquired.project_name));
        self.registry
            .set_project(job, acquired.project_root, acquired.project_name)
    }

    fn fail_terminal(
        &self,
        job: JobId,
        events: &Arc<EventLog>,
        err: PipelineError,
        reclaim_workspace: bool,
    ) {
        let mut message = err.to_string();
        if let Some(remediation) = err.remediation() {
            message.push(' ');
            message.push_str(remediation);
        }
        tracing::warn!(%job, %err, "pipeline failed");
        events.finish(Outcome::Failure { message });

        if reclaim_workspace {
            if let Err(cleanup_err) = self.registry.reclaim_workspace(job) {
                tracing::warn!(%job, %cleanup_err, "workspace reclamation failed");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::charm::{ConfigOption, OptionSet, OptionType};
    use std::fs;
    use std::io::{Cursor, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn stub(dir: &Path, name: &str, script: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn upload_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_directory("demo_app", FileOptions::default())
            .unwrap();
        writer
            .start_file("demo_app/requirements.txt", FileOptions::default())
            .unwrap();
        writer.write_all(b"Flask==2.3.0\n").unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn test_orchestrator(tmp: &TempDir) -> Orchestrator {
        let tools = tmp.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let rock_tool = stub(
            &tools,
            "rockcraft",
            r#"case "$1" in
init) echo "rock init"; echo "name: stub" > rockcraft.yaml ;;
pack) echo "rock pack"; printf R > demo-app_1.0_amd64.rock ;;
*) exit 1 ;;
esac"#,
        );
        let charm_tool = stub(
            &tools,
            "charmcraft",
            r#"case "$1" in
init) echo "charm init"; printf 'name: %s\nsummary: stub\n' "$3" > charmcraft.yaml ;;
pack) echo "charm pack"; printf C > demo-app.charm ;;
*) exit 1 ;;
esac"#,
        );

        let config = ForgeConfig {
            storage_root: tmp.path().join("jobs"),
            rock_tool,
            charm_tool,
            ..ForgeConfig::default()
        };
        Orchestrator::new(config)
    }

    fn wait_for_outcome(orch: &Orchestrator, job: JobId) -> (Vec<StatusEvent>, Outcome) {
        let mut seen = Vec::new();
        let mut cursor = 0;
        for _ in 0..200 {
            let (events, outcome) = orch.events(job, cursor).unwrap();
            cursor += events.len();
            seen.extend(events);
            if let Some(outcome) = outcome {
                return (seen, outcome);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("pipeline did not finish; events so far: {seen:#?}");
    }

    #[test]
    fn full_pipeline_from_archive_to_bundle() {
        let tmp = TempDir::new().unwrap();
        let orch = test_orchestrator(&tmp);

        let mut options = OptionSet::new();
        options
            .add(ConfigOption::new("workers", OptionType::Int, true, Some("2".into())).unwrap())
            .unwrap();

        let job = orch
            .submit(JobRequest {
                source: SourceSpec::Archive {
                    data: Box::new(Cursor::new(upload_zip())),
                    filename: "demo_app.zip".to_string(),
                },
                framework: Framework::Flask,
                integrations: vec!["postgresql".to_string(), "prometheus".to_string()],
                options,
            })
            .unwrap();

        let (events, outcome) = wait_for_outcome(&orch, job);
        let bundle_path = match outcome {
            Outcome::Success { bundle } => bundle,
            Outcome::Failure { message } => panic!("pipeline failed: {message}\n{events:#?}"),
        };
        assert!(bundle_path.exists());

        // Tool output was streamed into the log, in order.
        let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
        let rock_pos = texts.iter().position(|t| *t == "rock pack").unwrap();
        let charm_pos = texts.iter().position(|t| *t == "charm pack").unwrap();
        assert!(rock_pos < charm_pos);

        // Retrieval is one-shot and reclaims everything.
        let bytes = orch.retrieve(job).unwrap();
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).expect("bundle bytes are a zip");
        assert_eq!(archive.len(), 2);
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["demo-app.charm", "demo-app_1.0_amd64.rock"]);

        assert!(!bundle_path.exists());
        assert!(matches!(
            orch.events(job, 0),
            Err(PipelineError::UnknownJob(_))
        ));
    }

    #[test]
    fn validation_failure_is_terminal_and_reclaims_the_workspace() {
        let tmp = TempDir::new().unwrap();
        let orch = test_orchestrator(&tmp);

        // go.mod is absent from the upload.
        let job = orch
            .submit(JobRequest {
                source: SourceSpec::Archive {
                    data: Box::new(Cursor::new(upload_zip())),
                    filename: "demo_app.zip".to_string(),
                },
                framework: Framework::Go,
                integrations: vec![],
                options: OptionSet::new(),
            })
            .unwrap();

        let (_, outcome) = wait_for_outcome(&orch, job);
        match outcome {
            Outcome::Failure { message } => assert!(message.contains("go.mod"), "{message}"),
            Outcome::Success { .. } => panic!("expected validation failure"),
        }

        let workspace = tmp.path().join("jobs").join(job.to_string());
        assert!(!workspace.exists());

        // The terminal failure stays readable; retrieval is a client error.
        assert!(matches!(
            orch.retrieve(job),
            Err(PipelineError::NotReady { .. })
        ));

        // Explicit abandonment reclaims the entry.
        orch.abandon(job).unwrap();
        assert!(matches!(
            orch.events(job, 0),
            Err(PipelineError::UnknownJob(_))
        ));
    }

    #[test]
    fn packaging_failure_keeps_earlier_artifacts_for_retry() {
        let tmp = TempDir::new().unwrap();
        let tools = tmp.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let rock_tool = stub(
            &tools,
            "rockcraft",
            r#"case "$1" in
init) echo "name: stub" > rockcraft.yaml ;;
pack) echo "boom" >&2; exit 1 ;;
esac"#,
        );
        let charm_tool = stub(&tools, "charmcraft", "exit 1");

        let config = ForgeConfig {
            storage_root: tmp.path().join("jobs"),
            rock_tool,
            charm_tool,
            ..ForgeConfig::default()
        };
        let orch = Orchestrator::new(config);

        let job = orch
            .submit(JobRequest {
                source: SourceSpec::Archive {
                    data: Box::new(Cursor::new(upload_zip())),
                    filename: "demo_app.zip".to_string(),
                },
                framework: Framework::Flask,
                integrations: vec![],
                options: OptionSet::new(),
            })
            .unwrap();

        let (events, outcome) = wait_for_outcome(&orch, job);
        assert!(matches!(outcome, Outcome::Failure { .. }));
        // The failing tool's stderr reached the log before the terminal event.
        assert!(events.iter().any(|e| e.text == "boom"));

        // The workspace and the successful init's manifest survive for retry.
        let project = tmp
            .path()
            .join("jobs")
            .join(job.to_string())
            .join("project")
            .join("demo_app");
        assert!(project.join("rockcraft.yaml").is_file());

        // Later stages stay blocked behind the failed pack.
        assert!(matches!(
            orch.run_stage(job, Stage::Bundle),
            Err(PipelineError::StageNotReady { .. })
        ));
    }

    #[test]
    fn stage_reentry_reruns_mutate_after_manifest_edit() {
        let tmp = TempDir::new().unwrap();
        let orch = test_orchestrator(&tmp);

        let job = orch
            .submit(JobRequest {
                source: SourceSpec::Archive {
                    data: Box::new(Cursor::new(upload_zip())),
                    filename: "demo_app.zip".to_string(),
                },
                framework: Framework::Flask,
                integrations: vec!["ingress".to_string()],
                options: OptionSet::new(),
            })
            .unwrap();

        let (_, outcome) = wait_for_outcome(&orch, job);
        assert!(matches!(outcome, Outcome::Success { .. }));

        // User edits the manifest, then re-runs only the mutate stage.
        let manifest = tmp
            .path()
            .join("jobs")
            .join(job.to_string())
            .join("charm")
            .join("charmcraft.yaml");
        let edited = fs::read_to_string(&manifest)
            .unwrap()
            .replace("summary: stub", "summary: edited by hand");
        fs::write(&manifest, &edited).unwrap();

        orch.run_stage(job, Stage::OperatorMutate).unwrap();
        let text = fs::read_to_string(&manifest).unwrap();
        assert!(text.contains("edited by hand"));
        assert!(text.contains("ingress"));
    }
}
