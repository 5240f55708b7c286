//! Shared scope configuration and the per-pass resolution context.
//!
//! `scope_config.yaml` is read once at the start of a regeneration pass and
//! frozen, together with the device's correction snapshot, into a
//! `ResolutionContext` that every lookup receives explicitly.

use super::records::{CorrectionPayload, CorrectionRecord};
use super::store::CorrectionSet;
use crate::error::CorrectionError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One entry of the global error → replacement list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPattern {
    pub pattern: String,
    pub replacement: String,
    /// Treat `pattern` as a regex instead of a literal
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// prefix → category for every device
    #[serde(default)]
    pub standard: BTreeMap<String, String>,
    #[serde(default)]
    pub global_patterns: Vec<GlobalPattern>,
    /// vendor → prefix → category
    #[serde(default)]
    pub vendors: BTreeMap<String, BTreeMap<String, String>>,
}

impl ScopeConfig {
    /// Missing file means an empty configuration
    pub fn load(path: &Path) -> Result<Self, CorrectionError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CorrectionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Global text rule ready to apply
#[derive(Debug, Clone)]
pub(crate) enum TextRule {
    Literal { pattern: String, replacement: String },
    Regex { pattern: Regex, replacement: String },
}

impl TextRule {
    pub(crate) fn key(&self) -> &str {
        match self {
            TextRule::Literal { pattern, .. } => pattern,
            TextRule::Regex { pattern, .. } => pattern.as_str(),
        }
    }

    pub(crate) fn apply(&self, text: &str) -> Option<String> {
        match self {
            TextRule::Literal {
                pattern,
                replacement,
            } => text.contains(pattern.as_str()).then(|| text.replace(pattern.as_str(), replacement)),
            TextRule::Regex {
                pattern,
                replacement,
            } => pattern
                .is_match(text)
                .then(|| pattern.replace_all(text, replacement.as_str()).into_owned()),
        }
    }
}

/// Where a global text rule came from
#[derive(Debug, Clone)]
pub(crate) struct GlobalTextRule {
    pub rule: TextRule,
    /// Appended global record, `None` for `scope_config.yaml` entries
    pub record: Option<CorrectionRecord>,
}

/// Everything one regeneration pass may consult, loaded up front
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub device_id: String,
    pub vendor: Option<String>,
    pub corrections: CorrectionSet,
    pub(crate) global_text: Vec<GlobalTextRule>,
    pub(crate) global_categories: Vec<(Regex, CorrectionRecord)>,
    pub(crate) vendor_map: BTreeMap<String, String>,
    pub(crate) standard_map: BTreeMap<String, String>,
}

impl ResolutionContext {
    pub fn new(
        device_id: impl Into<String>,
        vendor: Option<String>,
        config: &ScopeConfig,
        corrections: CorrectionSet,
    ) -> Result<Self, CorrectionError> {
        let mut global_text = Vec::new();
        for entry in &config.global_patterns {
            let rule = if entry.regex {
                TextRule::Regex {
                    pattern: compile(&entry.pattern)?,
                    replacement: entry.replacement.clone(),
                }
            } else {
                TextRule::Literal {
                    pattern: entry.pattern.clone(),
                    replacement: entry.replacement.clone(),
                }
            };
            global_text.push(GlobalTextRule { rule, record: None });
        }

        let mut global_categories = Vec::new();
        for record in &corrections.global {
            match &record.payload {
                CorrectionPayload::TextReplacement {
                    citation_id: None,
                    original,
                    corrected,
                } => global_text.push(GlobalTextRule {
                    rule: TextRule::Literal {
                        pattern: original.clone(),
                        replacement: corrected.clone(),
                    },
                    record: Some(record.clone()),
                }),
                CorrectionPayload::CategoryOverride { prefix, .. } => {
                    global_categories.push((compile(prefix)?, record.clone()));
                }
                _ => {}
            }
        }

        let vendor_map = vendor
            .as_ref()
            .and_then(|v| config.vendors.get(v))
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            device_id: device_id.into(),
            vendor,
            corrections,
            global_text,
            global_categories,
            vendor_map,
            standard_map: config.standard.clone(),
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, CorrectionError> {
    Regex::new(pattern).map_err(|e| CorrectionError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}
