//! Framework-specific project validation.
//!
//! A pass/fail gate that runs once, before any packaging stage. The checks
//! are deliberately shallow (file presence, a declared dependency, a start
//! script): they exist to fail fast with a readable message instead of
//! letting the packaging tools produce cryptic errors half an hour in.

use std::fmt;
use std::path::Path;

use anyhow::Context;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Flask,
    Django,
    FastApi,
    ExpressJs,
    Go,
    SpringBoot,
    Other,
}

impl Framework {
    /// Case-insensitive parse; unrecognized tags map to `Other`, which
    /// validates trivially and packs without a profile.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "flask" => Framework::Flask,
            "django" => Framework::Django,
            "fastapi" => Framework::FastApi,
            "expressjs" => Framework::ExpressJs,
            "go" => Framework::Go,
            "springboot" => Framework::SpringBoot,
            _ => Framework::Other,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Framework::Flask => "flask",
            Framework::Django => "django",
            Framework::FastApi => "fastapi",
            Framework::ExpressJs => "expressjs",
            Framework::Go => "go",
            Framework::SpringBoot => "springboot",
            Framework::Other => "other",
        }
    }

    /// Image-builder init profile, where one exists for the framework.
    pub fn rock_profile(self) -> Option<String> {
        match self {
            Framework::Other => None,
            other => Some(format!("{}-framework", other.slug())),
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Validate the acquired tree for the chosen framework.
pub fn validate_project(project_root: &Path, framework: Framework) -> Result<(), PipelineError> {
    match framework {
        Framework::Flask => check_requirements(project_root, Some("flask")),
        Framework::FastApi => check_requirements(project_root, Some("fastapi")),
        Framework::Django => check_requirements(project_root, None),
        Framework::ExpressJs => check_package_json(project_root),
        Framework::Go => check_file_present(project_root, "go.mod"),
        Framework::SpringBoot => check_file_present(project_root, "pom.xml"),
        // No blocking check for unrecognized frameworks.
        Framework::Other => Ok(()),
    }
}

fn check_file_present(project_root: &Path, name: &str) -> Result<(), PipelineError> {
    if project_root.join(name).is_file() {
        Ok(())
    } else {
        Err(PipelineError::ValidationFailed {
            reason: format!("project is missing {name}"),
        })
    }
}

/// `requirements.txt` must exist; when `package` is given, it must also be
/// declared there.
fn check_requirements(project_root: &Path, package: Option<&str>) -> Result<(), PipelineError> {
    let path = project_root.join("requirements.txt");
    if !path.is_file() {
        return Err(PipelineError::ValidationFailed {
            reason: "project is missing requirements.txt".to_string(),
        });
    }

    let Some(package) = package else {
        return Ok(());
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading '{}'", path.display()))
        .map_err(PipelineError::Internal)?;

    if declares_package(&text, package) {
        Ok(())
    } else {
        Err(PipelineError::ValidationFailed {
            reason: format!("requirements.txt does not declare the '{package}' package"),
        })
    }
}

/// Match the leading package token of each requirement line, before any
/// version specifier, extras bracket, marker or comment.
fn declares_package(requirements: &str, package: &str) -> bool {
    for line in requirements.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let token: String = line
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect();
        if token.eq_ignore_ascii_case(package) {
            return true;
        }
    }
    false
}

fn check_package_json(project_root: &Path) -> Result<(), PipelineError> {
    let path = project_root.join("package.json");
    if !path.is_file() {
        return Err(PipelineError::ValidationFailed {
            reason: "project is missing package.json".to_string(),
        });
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading '{}'", path.display()))
        .map_err(PipelineError::Internal)?;
    let parsed: serde_json::Value =
        serde_json::from_str(&text).map_err(|err| PipelineError::ValidationFailed {
            reason: format!("package.json is not valid JSON: {err}"),
        })?;

    let has_start = parsed
        .get("scripts")
        .and_then(|scripts| scripts.get("start"))
        .is_some();
    if has_start {
        Ok(())
    } else {
        Err(PipelineError::ValidationFailed {
            reason: "package.json is missing a 'start' script".to_string(),
        })
    }
}
