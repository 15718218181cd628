//! Rule-driven data classification.
//!
//! [`ClassificationEngine`] loads ordered rules from TOML (see
//! `config/data_classification.toml`) and implements the core
//! [`Classifier`] trait:
//!
//! 1. The first rule whose `resource_types` lists the type decides the level.
//! 2. Without a match, `default_classification` applies (`sensitive` unless
//!    configured).
//! 3. Context overrides run last and only ever raise the level:
//!    `uncertain` escalates to `escalate_to`, `external_source` enforces
//!    `minimum`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use ordinance_rag_core::classify::Classifier;
use ordinance_rag_core::models::{Classification, ClassifyContext};

const BUILTIN_RULES: &str = include_str!("../config/data_classification.toml");

/// One classification rule.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClassificationRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub resource_types: Vec<String>,
    pub classification: Classification,
    #[serde(default = "default_residency")]
    pub residency: String,
    #[serde(default = "default_cache")]
    pub cache: String,
    #[serde(default = "default_logging")]
    pub logging: String,
}

fn default_residency() -> String {
    "any".to_string()
}
fn default_cache() -> String {
    "allowed".to_string()
}
fn default_logging() -> String {
    "standard".to_string()
}

impl ClassificationRule {
    pub fn matches(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|t| t == resource_type)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
enum ContextOverride {
    Uncertain {
        #[serde(default = "default_escalation")]
        escalate_to: Classification,
    },
    ExternalSource {
        #[serde(default = "default_minimum")]
        minimum: Classification,
    },
}

fn default_escalation() -> Classification {
    Classification::Sensitive
}
fn default_minimum() -> Classification {
    Classification::Internal
}

fn default_classification() -> Classification {
    Classification::Sensitive
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<ClassificationRule>,
    #[serde(default = "default_classification")]
    default_classification: Classification,
    #[serde(default)]
    context_overrides: Vec<ContextOverride>,
}

/// Ordered rule set with a default level and context overrides.
#[derive(Debug, Clone)]
pub struct ClassificationEngine {
    rules: Vec<ClassificationRule>,
    default: Classification,
    overrides: Vec<ContextOverride>,
}

impl ClassificationEngine {
    /// Load rules from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!("Failed to read classification rules: {}", path.display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid classification rules: {}", path.display()))
    }

    /// The standard municipal rules shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_RULES)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RulesFile = toml::from_str(content)?;
        for rule in &file.rules {
            if rule.name.trim().is_empty() {
                bail!("classification rule with empty name");
            }
        }
        Ok(Self {
            rules: file.rules,
            default: file.default_classification,
            overrides: file.context_overrides,
        })
    }

    /// Rules file from config, or the built-in rules when none is set.
    pub fn from_config(rules_path: Option<&Path>) -> Result<Self> {
        match rules_path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    /// First rule matching `resource_type`.
    pub fn get_rule(&self, resource_type: &str) -> Option<&ClassificationRule> {
        self.rules.iter().find(|r| r.matches(resource_type))
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn default_classification(&self) -> Classification {
        self.default
    }

    fn apply_overrides(&self, mut level: Classification, context: &ClassifyContext) -> Classification {
        for rule in &self.overrides {
            match rule {
                ContextOverride::Uncertain { escalate_to } if context.uncertain => {
                    level = level.max(*escalate_to);
                }
                ContextOverride::ExternalSource { minimum } if context.external_source => {
                    level = level.max(*minimum);
                }
                _ => {}
            }
        }
        level
    }
}

impl Classifier for ClassificationEngine {
    fn classify(&self, resource_type: &str, context: &ClassifyContext) -> Classification {
        let base = self
            .get_rule(resource_type)
            .map_or(self.default, |r| r.classification);
        self.apply_overrides(base, context)
    }
}
