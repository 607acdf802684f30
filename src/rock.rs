//! Image packager.
//!
//! Drives the image-builder CLI through two independently retriable stages:
//! `init` writes the image manifest into the project directory, `pack`
//! produces the binary image. Init is expected to be fast and gets the
//! tight metadata timeout; pack invokes a real build backend and gets the
//! long one.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::artifact::find_packed_artifact;
use crate::error::PipelineError;
use crate::validate::Framework;
use crate::StageContext;

pub const ROCK_MANIFEST: &str = "rockcraft.yaml";
pub const ROCK_EXTENSION: &str = "rock";

#[derive(Debug, Clone)]
pub struct RockPackager {
    project_root: PathBuf,
    project_name: String,
    framework: Framework,
}

impl RockPackager {
    pub fn new(project_root: impl Into<PathBuf>, project_name: impl Into<String>, framework: Framework) -> Self {
        Self {
            project_root: project_root.into(),
            project_name: project_name.into(),
            framework,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.project_root.join(ROCK_MANIFEST)
    }

    /// Generate the image manifest. A stale manifest from an earlier init is
    /// deleted first so re-running reflects exactly the new init's output.
    pub fn init(&self, ctx: &StageContext<'_>) -> Result<PathBuf, PipelineError> {
        let manifest = self.manifest_path();
        if manifest.exists() {
            std::fs::remove_file(&manifest)
                .with_context(|| format!("removing stale manifest '{}'", manifest.display()))
                .map_err(PipelineError::Internal)?;
        }

        ctx.events.status("Initializing rock manifest...");

        let mut spec = ctx
            .tool(&ctx.config.rock_tool, self.project_root.clone(), ctx.config.init_timeout)
            .arg("init")
            .env("ROCKCRAFT_ENABLE_EXPERIMENTAL_EXTENSIONS", "true");
        if let Some(profile) = self.framework.rock_profile() {
            spec = spec.arg(format!("--profile={profile}"));
        }
        spec = spec.args(["--name", &self.project_name]);

        ctx.runner
            .run(&spec, ctx.cancel, &mut |line| ctx.events.log(line))?;

        if !manifest.is_file() {
            return Err(PipelineError::ManifestNotProduced {
                tool: ctx.config.rock_tool.clone(),
                path: manifest,
            });
        }

        ctx.events.status("Rock manifest ready.");
        Ok(manifest)
    }

    /// Pack the image. Build backends may compile dependencies, so this
    /// runs under the long pack timeout.
    pub fn pack(&self, ctx: &StageContext<'_>) -> Result<PathBuf, PipelineError> {
        ctx.events
            .status("Packing rock image (this can take a while)...");

        let spec = ctx
            .tool(&ctx.config.rock_tool, self.project_root.clone(), ctx.config.pack_timeout)
            .arg("pack")
            .env("ROCKCRAFT_ENABLE_EXPERIMENTAL_EXTENSIONS", "true");

        ctx.runner
            .run(&spec, ctx.cancel, &mut |line| ctx.events.log(line))?;

        let artifact = find_packed_artifact(&self.project_root, ROCK_EXTENSION, ctx.events)?;
        ctx.events
            .status(format!("Rock packing complete: {}", artifact.display()));
        Ok(artifact)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }
}
