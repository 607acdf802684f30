//! Operator packager.
//!
//! Drives the operator-builder CLI through three independently retriable
//! stages: `init` generates the operator manifest, `mutate` injects the
//! declared integrations and config options, `pack` produces the operator
//! archive. The packager owns a dedicated subdirectory under the job
//! workspace; the manifest is user-editable between mutate and pack, and
//! mutate may be re-run after an edit.

pub mod catalog;
pub mod manifest;
pub mod options;

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::artifact::find_packed_artifact;
use crate::error::PipelineError;
use crate::StageContext;

pub use options::{ConfigOption, OptionSet, OptionType};

pub const CHARM_MANIFEST: &str = "charmcraft.yaml";
pub const CHARM_EXTENSION: &str = "charm";

/// Name of the packager's subdirectory under the job workspace.
pub const CHARM_SUBDIR: &str = "charm";

#[derive(Debug, Clone)]
pub struct CharmPackager {
    charm_dir: PathBuf,
    project_name: String,
    integrations: Vec<String>,
    options: Vec<ConfigOption>,
}

impl CharmPackager {
    /// Construct against `<workspace>/charm`, creating it if absent.
    /// Constructing twice against the same workspace must not fail.
    pub fn new(
        workspace: &Path,
        project_name: impl Into<String>,
        integrations: Vec<String>,
        options: Vec<ConfigOption>,
    ) -> Result<Self, PipelineError> {
        let charm_dir = workspace.join(CHARM_SUBDIR);
        std::fs::create_dir_all(&charm_dir)
            .with_context(|| format!("creating operator directory '{}'", charm_dir.display()))
            .map_err(PipelineError::Internal)?;
        Ok(Self {
            charm_dir,
            project_name: project_name.into(),
            integrations,
            options,
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.charm_dir.join(CHARM_MANIFEST)
    }

    pub fn charm_dir(&self) -> &Path {
        &self.charm_dir
    }

    /// Generate the operator manifest in the dedicated subdirectory.
    pub fn init(&self, ctx: &StageContext<'_>) -> Result<PathBuf, PipelineError> {
        let manifest = self.manifest_path();
        if manifest.exists() {
            std::fs::remove_file(&manifest)
                .with_context(|| format!("removing stale manifest '{}'", manifest.display()))
                .map_err(PipelineError::Internal)?;
        }

        ctx.events.status("Initializing charm project...");

        let spec = ctx
            .tool(&ctx.config.charm_tool, self.charm_dir.clone(), ctx.config.init_timeout)
            .args(["init", "--name", &self.project_name]);
        ctx.runner
            .run(&spec, ctx.cancel, &mut |line| ctx.events.log(line))?;

        if !manifest.is_file() {
            return Err(PipelineError::ManifestNotProduced {
                tool: ctx.config.charm_tool.clone(),
                path: manifest,
            });
        }

        ctx.events.status("Charm project initialized.");
        Ok(manifest)
    }

    /// Write the declared integrations and options into the manifest.
    pub fn mutate(&self, ctx: &StageContext<'_>) -> Result<(), PipelineError> {
        ctx.events.status("Updating charm manifest...");
        manifest::apply_declarations(&self.manifest_path(), &self.integrations, &self.options)?;
        ctx.events.status("Charm manifest updated.");
        Ok(())
    }

    /// Pack the operator archive.
    pub fn pack(&self, ctx: &StageContext<'_>) -> Result<PathBuf, PipelineError> {
        ctx.events
            .status("Packing charm (this can take a while)...");

        let spec = ctx
            .tool(&ctx.config.charm_tool, self.charm_dir.clone(), ctx.config.pack_timeout)
            .arg("pack");
        ctx.runner
            .run(&spec, ctx.cancel, &mut |line| ctx.events.log(line))?;

        let artifact = find_packed_artifact(&self.charm_dir, CHARM_EXTENSION, ctx.events)?;
        ctx.events
            .status(format!("Charm packing complete: {}", artifact.display()));
        Ok(artifact)
    }

    /// Remove the dedicated subdirectory. Safe to call repeatedly; missing
    /// paths are a no-op.
    pub fn release(&self) {
        if self.charm_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.charm_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForgeConfig;
    use crate::events::EventLog;
    use crate::runner::{CancelToken, CommandRunner};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn construction_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let first = CharmPackager::new(tmp.path(), "my-app", vec![], vec![]).unwrap();
        assert!(first.charm_dir().is_dir());
        // Same workspace again: must not fail on "already exists".
        CharmPackager::new(tmp.path(), "my-app", vec![], vec![]).unwrap();
    }

    #[test]
    fn release_is_safe_to_repeat() {
        let tmp = TempDir::new().unwrap();
        let packager = CharmPackager::new(tmp.path(), "my-app", vec![], vec![]).unwrap();
        fs::write(packager.manifest_path(), "name: my-app\n").unwrap();

        packager.release();
        assert!(!packager.charm_dir().exists());
        packager.release();
        packager.release();
    }

    #[cfg(unix)]
    fn stub_charmcraft(dir: &Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("charmcraft");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn init_then_mutate_then_pack() {
        let tools = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let tool = stub_charmcraft(
            tools.path(),
            r#"case "$1" in
init) printf 'name: %s\nsummary: generated\n' "$3" > charmcraft.yaml ;;
pack) touch my-app_ubuntu-22.04-amd64.charm ;;
*) exit 1 ;;
esac"#,
        );

        let config = ForgeConfig {
            charm_tool: tool,
            ..ForgeConfig::default()
        };
        let runner = CommandRunner::new(&config.fallback_bin_dir);
        let cancel = CancelToken::new();
        let events = EventLog::new();
        let ctx = StageContext {
            config: &config,
            runner: &runner,
            cancel: &cancel,
            events: &events,
        };

        let packager = CharmPackager::new(
            workspace.path(),
            "my-app",
            vec!["postgresql".to_string()],
            vec![ConfigOption::new("workers", OptionType::Int, true, Some("2".into())).unwrap()],
        )
        .unwrap();

        let manifest = packager.init(&ctx).unwrap();
        assert!(manifest.is_file());

        packager.mutate(&ctx).unwrap();
        let text = fs::read_to_string(&manifest).unwrap();
        assert!(text.contains("postgresql_client"));
        assert!(text.contains("workers"));

        let artifact = packager.pack(&ctx).unwrap();
        assert_eq!(
            artifact.file_name().unwrap(),
            "my-app_ubuntu-22.04-amd64.charm"
        );
    }
}
