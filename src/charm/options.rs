//! Operator config options.
//!
//! Options are declared per job and written into the operator manifest
//! during mutation. Two invariants are enforced at construction time rather
//! than at manifest-write time: a non-optional option must not carry a
//! default value, and keys are unique case-insensitively within a job.

use anyhow::{Context, Result};
use serde_yaml::Value;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    String,
    Int,
    Bool,
    Float,
    Secret,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionType::String => "string",
            OptionType::Int => "int",
            OptionType::Bool => "boolean",
            OptionType::Float => "float",
            OptionType::Secret => "secret",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "string" => Some(OptionType::String),
            "int" => Some(OptionType::Int),
            "bool" | "boolean" => Some(OptionType::Bool),
            "float" => Some(OptionType::Float),
            "secret" => Some(OptionType::Secret),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigOption {
    pub key: String,
    pub value_type: OptionType,
    pub optional: bool,
    pub description: Option<String>,
    default: Option<String>,
}

impl ConfigOption {
    pub fn new(
        key: impl Into<String>,
        value_type: OptionType,
        optional: bool,
        default: Option<String>,
    ) -> Result<Self, PipelineError> {
        let key = key.into();
        if !optional && default.is_some() {
            return Err(PipelineError::DefaultOnRequiredOption { key });
        }
        Ok(Self {
            key,
            value_type,
            optional,
            description: None,
            default,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Coerce the raw default to its declared type: int and float by
    /// numeric parse, bool by case-insensitive membership in
    /// {"true", "1", "yes"} (anything else is false), string and secret
    /// verbatim.
    pub fn typed_default(&self) -> Result<Option<Value>> {
        let Some(raw) = self.default.as_deref() else {
            return Ok(None);
        };

        let value = match self.value_type {
            OptionType::Int => {
                let parsed: i64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("option '{}': '{raw}' is not an integer", self.key))?;
                Value::Number(parsed.into())
            }
            OptionType::Float => {
                let parsed: f64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("option '{}': '{raw}' is not a number", self.key))?;
                Value::Number(serde_yaml::Number::from(parsed))
            }
            OptionType::Bool => {
                let truthy = matches!(
                    raw.trim().to_ascii_lowercase().as_str(),
                    "true" | "1" | "yes"
                );
                Value::Bool(truthy)
            }
            OptionType::String | OptionType::Secret => Value::String(raw.to_string()),
        };
        Ok(Some(value))
    }
}

/// Per-job option collection enforcing the case-insensitive key uniqueness
/// invariant at add-time.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    options: Vec<ConfigOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, option: ConfigOption) -> Result<(), PipelineError> {
        let collision = self
            .options
            .iter()
            .any(|existing| existing.key.eq_ignore_ascii_case(&option.key));
        if collision {
            return Err(PipelineError::DuplicateOption { key: option.key });
        }
        self.options.push(option);
        Ok(())
    }

    pub fn as_slice(&self) -> &[ConfigOption] {
        &self.options
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_option_rejects_default_at_construction() {
        let err = ConfigOption::new("port", OptionType::Int, false, Some("8080".into()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DefaultOnRequiredOption { .. }));

        assert!(ConfigOption::new("port", OptionType::Int, false, None).is_ok());
    }

    #[test]
    fn int_default_parses_to_integer() {
        let opt = ConfigOption::new("workers", OptionType::Int, true, Some(" 4 ".into())).unwrap();
        assert_eq!(opt.typed_default().unwrap(), Some(Value::Number(4.into())));

        let bad = ConfigOption::new("workers", OptionType::Int, true, Some("four".into())).unwrap();
        assert!(bad.typed_default().is_err());
    }

    #[test]
    fn bool_default_uses_truthy_membership() {
        for raw in ["true", "TRUE", "1", "Yes"] {
            let opt =
                ConfigOption::new("debug", OptionType::Bool, true, Some(raw.into())).unwrap();
            assert_eq!(opt.typed_default().unwrap(), Some(Value::Bool(true)), "{raw}");
        }
        for raw in ["false", "0", "no", "anything"] {
            let opt =
                ConfigOption::new("debug", OptionType::Bool, true, Some(raw.into())).unwrap();
            assert_eq!(opt.typed_default().unwrap(), Some(Value::Bool(false)), "{raw}");
        }
    }

    #[test]
    fn float_and_secret_defaults() {
        let ratio =
            ConfigOption::new("ratio", OptionType::Float, true, Some("2.5".into())).unwrap();
        assert_eq!(
            ratio.typed_default().unwrap(),
            Some(Value::Number(serde_yaml::Number::from(2.5)))
        );

        let token =
            ConfigOption::new("token", OptionType::Secret, true, Some("s3cret".into())).unwrap();
        assert_eq!(
            token.typed_default().unwrap(),
            Some(Value::String("s3cret".into()))
        );
    }

    #[test]
    fn key_collisions_are_case_insensitive() {
        let mut set = OptionSet::new();
        set.add(ConfigOption::new("Port", OptionType::Int, true, None).unwrap())
            .unwrap();
        let err = set
            .add(ConfigOption::new("PORT", OptionType::String, true, None).unwrap())
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateOption { .. }));
        assert_eq!(set.as_slice().len(), 1);
    }
}
