use crate::error::CorrectionError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Breadth of applicability, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Device,
    Vendor,
    Standard,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Device => "device",
            Scope::Vendor => "vendor",
            Scope::Standard => "standard",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = CorrectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "device" => Ok(Scope::Device),
            "vendor" => Ok(Scope::Vendor),
            "standard" => Ok(Scope::Standard),
            "global" => Ok(Scope::Global),
            other => Err(CorrectionError::EmptyPayload(format!("unknown scope '{}'", other))),
        }
    }
}

/// One logical stream per kind; doubles as the file stem on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    TextReplacement,
    FieldOverride,
    CategoryOverride,
    AddedEntity,
    Confirmation,
}

impl CorrectionKind {
    pub const ALL: [CorrectionKind; 5] = [
        CorrectionKind::TextReplacement,
        CorrectionKind::FieldOverride,
        CorrectionKind::CategoryOverride,
        CorrectionKind::AddedEntity,
        CorrectionKind::Confirmation,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            CorrectionKind::TextReplacement => "text_replacements",
            CorrectionKind::FieldOverride => "field_overrides",
            CorrectionKind::CategoryOverride => "category_overrides",
            CorrectionKind::AddedEntity => "added_entities",
            CorrectionKind::Confirmation => "confirmations",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionKind::TextReplacement => "text_replacement",
            CorrectionKind::FieldOverride => "field_override",
            CorrectionKind::CategoryOverride => "category_override",
            CorrectionKind::AddedEntity => "added_entity",
            CorrectionKind::Confirmation => "confirmation",
        }
    }
}

impl fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrectionKind {
    type Err = CorrectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        CorrectionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized || k.file_stem() == normalized)
            .ok_or_else(|| CorrectionError::EmptyPayload(format!("unknown correction kind '{}'", s)))
    }
}

/// Kind-specific content of a correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionPayload {
    /// Device scope: exact substring replacement inside one cited block.
    /// Global scope: literal pattern applied to all text, no citation.
    TextReplacement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        citation_id: Option<String>,
        original: String,
        corrected: String,
    },
    FieldOverride {
        field_id: String,
        overrides: BTreeMap<String, serde_json::Value>,
    },
    /// `prefix` is an entity id or id prefix; at global scope it is a regex
    CategoryOverride { prefix: String, category: String },
    AddedEntity {
        entity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        citation_id: Option<String>,
    },
    Confirmation { citation_id: String },
}

impl CorrectionPayload {
    pub fn kind(&self) -> CorrectionKind {
        match self {
            CorrectionPayload::TextReplacement { .. } => CorrectionKind::TextReplacement,
            CorrectionPayload::FieldOverride { .. } => CorrectionKind::FieldOverride,
            CorrectionPayload::CategoryOverride { .. } => CorrectionKind::CategoryOverride,
            CorrectionPayload::AddedEntity { .. } => CorrectionKind::AddedEntity,
            CorrectionPayload::Confirmation { .. } => CorrectionKind::Confirmation,
        }
    }

    /// Key the record is filed under
    pub fn target_key(&self) -> String {
        match self {
            CorrectionPayload::TextReplacement {
                citation_id,
                original,
                ..
            } => citation_id.clone().unwrap_or_else(|| original.clone()),
            CorrectionPayload::FieldOverride { field_id, .. } => field_id.clone(),
            CorrectionPayload::CategoryOverride { prefix, .. } => prefix.clone(),
            CorrectionPayload::AddedEntity { entity_id, .. } => entity_id.clone(),
            CorrectionPayload::Confirmation { citation_id } => citation_id.clone(),
        }
    }
}

/// An append-only correction. Never edited or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub scope: Scope,
    /// Device id at device scope, vendor name at vendor scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub target_key: String,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: CorrectionPayload,
}

impl CorrectionRecord {
    pub fn new(
        scope: Scope,
        owner: Option<String>,
        payload: CorrectionPayload,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            owner,
            target_key: payload.target_key(),
            reason: reason.into(),
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> CorrectionKind {
        self.payload.kind()
    }

    /// Structural checks run before a record is appended
    pub fn validate(&self) -> Result<(), CorrectionError> {
        let invalid_scope = || CorrectionError::InvalidScope {
            kind: self.kind().to_string(),
            scope: self.scope.to_string(),
        };

        match self.scope {
            Scope::Device | Scope::Vendor => match self.owner.as_deref() {
                Some(owner) if !owner.trim().is_empty() => validate_owner(owner)?,
                _ => {
                    return Err(CorrectionError::MissingOwner {
                        scope: self.scope.to_string(),
                        what: if self.scope == Scope::Device {
                            "a device id".to_string()
                        } else {
                            "a vendor name".to_string()
                        },
                    });
                }
            },
            Scope::Standard | Scope::Global => {}
        }

        match &self.payload {
            CorrectionPayload::TextReplacement {
                citation_id,
                original,
                ..
            } => {
                require("original", original)?;
                match (self.scope, citation_id) {
                    (Scope::Device, Some(id)) => require("citation_id", id)?,
                    (Scope::Device, None) => {
                        return Err(CorrectionError::EmptyPayload(
                            "device text replacements need a citation_id".to_string(),
                        ))
                    }
                    (Scope::Global, None) => {}
                    _ => return Err(invalid_scope()),
                }
            }
            CorrectionPayload::FieldOverride {
                field_id,
                overrides,
            } => {
                if self.scope == Scope::Global {
                    return Err(invalid_scope());
                }
                require("field_id", field_id)?;
                if overrides.is_empty() {
                    return Err(CorrectionError::EmptyPayload("overrides".to_string()));
                }
            }
            CorrectionPayload::CategoryOverride { prefix, category } => {
                require("prefix", prefix)?;
                require("category", category)?;
                if self.scope == Scope::Global {
                    Regex::new(prefix).map_err(|e| CorrectionError::InvalidPattern {
                        pattern: prefix.clone(),
                        message: e.to_string(),
                    })?;
                }
            }
            CorrectionPayload::AddedEntity {
                entity_id,
                description,
                ..
            } => {
                if self.scope != Scope::Device {
                    return Err(invalid_scope());
                }
                require("entity_id", entity_id)?;
                require("description", description)?;
            }
            CorrectionPayload::Confirmation { citation_id } => {
                if self.scope != Scope::Device {
                    return Err(invalid_scope());
                }
                require("citation_id", citation_id)?;
            }
        }
        Ok(())
    }
}

/// Device ids and vendor names name directories under the store root, so
/// they must be a single plain path component.
pub fn validate_owner(owner: &str) -> Result<(), CorrectionError> {
    let invalid = |reason: &str| CorrectionError::InvalidOwner {
        owner: owner.to_string(),
        reason: reason.to_string(),
    };
    if owner.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if owner.contains(['/', '\\', '\0']) {
        return Err(invalid("contains a path separator"));
    }
    if owner.contains("..") {
        return Err(invalid("contains '..'"));
    }
    if owner.starts_with('.') {
        return Err(invalid("starts with '.'"));
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<(), CorrectionError> {
    if value.trim().is_empty() {
        Err(CorrectionError::EmptyPayload(field.to_string()))
    } else {
        Ok(())
    }
}
