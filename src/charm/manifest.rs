//! Operator manifest mutation.
//!
//! Read-modify-write of the manifest the operator-builder's init step
//! generated. Only the relation and option blocks are touched; every other
//! key survives verbatim and in its original order (`serde_yaml::Mapping`
//! iterates in insertion order). Any read/parse/write failure is wrapped in
//! `ManifestUpdateFailed`.

use std::path::Path;

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};

use crate::charm::catalog::{self, Direction};
use crate::charm::options::ConfigOption;
use crate::error::PipelineError;

const DEFAULT_OPTION_DESCRIPTION: &str = "A custom config option.";

/// Inject the configured integrations and options into the manifest.
/// Unrecognized integration ids are dropped silently; only non-empty
/// relation blocks are written.
pub fn apply_declarations(
    manifest_path: &Path,
    integrations: &[String],
    options: &[ConfigOption],
) -> Result<(), PipelineError> {
    rewrite(manifest_path, integrations, options).map_err(|source| {
        PipelineError::ManifestUpdateFailed {
            path: manifest_path.to_path_buf(),
            source,
        }
    })
}

fn rewrite(manifest_path: &Path, integrations: &[String], options: &[ConfigOption]) -> Result<()> {
    let text = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("reading manifest '{}'", manifest_path.display()))?;
    let mut doc: Mapping = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing manifest '{}'", manifest_path.display()))?;

    let (provides, requires) = partition_relations(integrations);
    if !provides.is_empty() {
        doc.insert(Value::from("provides"), Value::Mapping(provides));
    }
    if !requires.is_empty() {
        doc.insert(Value::from("requires"), Value::Mapping(requires));
    }

    let declared = declare_options(options)?;
    if !declared.is_empty() {
        doc.insert(Value::from("options"), Value::Mapping(declared));
    }

    let rendered = serde_yaml::to_string(&doc).context("serializing manifest")?;
    std::fs::write(manifest_path, rendered)
        .with_context(|| format!("writing manifest '{}'", manifest_path.display()))?;
    Ok(())
}

fn partition_relations(integrations: &[String]) -> (Mapping, Mapping) {
    let mut provides = Mapping::new();
    let mut requires = Mapping::new();

    for id in integrations {
        let Some(entry) = catalog::lookup(id) else {
            continue;
        };

        let mut relation = Mapping::new();
        relation.insert(Value::from("interface"), Value::from(entry.interface));
        if entry.optional {
            relation.insert(Value::from("optional"), Value::from(true));
        }
        if let Some(limit) = entry.limit {
            relation.insert(Value::from("limit"), Value::from(limit));
        }

        let block = match entry.direction {
            Direction::Provide => &mut provides,
            Direction::Require => &mut requires,
        };
        block.insert(Value::from(entry.relation), Value::Mapping(relation));
    }

    (provides, requires)
}

fn declare_options(options: &[ConfigOption]) -> Result<Mapping> {
    let mut declared = Mapping::new();
    for option in options {
        let mut entry = Mapping::new();
        entry.insert(Value::from("type"), Value::from(option.value_type.as_str()));
        entry.insert(
            Value::from("description"),
            Value::from(
                option
                    .description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPTION_DESCRIPTION.to_string()),
            ),
        );
        if option.optional {
            if let Some(default) = option.typed_default()? {
                entry.insert(Value::from("default"), default);
            }
        }
        declared.insert(Value::from(option.key.clone()), Value::Mapping(entry));
    }
    Ok(declared)
}
