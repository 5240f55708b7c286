//! Scope-prioritized lookups over a `ResolutionContext`.
//!
//! Priority, first match wins: device → vendor → standard → global → original.
//! Within one scope the most recently appended record wins.

use super::records::{CorrectionKind, CorrectionPayload, CorrectionRecord, Scope};
use super::scope::ResolutionContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Which layer produced a resolved value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Original,
    Device,
    Vendor,
    Standard,
    Global,
    /// Human-verified as extracted
    Confirmed,
}

impl From<Scope> for Resolution {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Device => Resolution::Device,
            Scope::Vendor => Resolution::Vendor,
            Scope::Standard => Resolution::Standard,
            Scope::Global => Resolution::Global,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCorrection {
    pub kind: CorrectionKind,
    pub scope: Scope,
    pub target_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedReference {
    pub kind: CorrectionKind,
    pub scope: Scope,
    pub target_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegenerationReport {
    pub applied: Vec<AppliedCorrection>,
    pub unmatched: Vec<UnmatchedReference>,
    pub confirmed: Vec<String>,
}

impl RegenerationReport {
    pub(crate) fn applied(&mut self, record: &CorrectionRecord, citation_id: Option<&str>) {
        self.applied.push(AppliedCorrection {
            kind: record.kind(),
            scope: record.scope,
            target_key: record.target_key.clone(),
            citation_id: citation_id.map(str::to_string),
        });
    }

    pub(crate) fn unmatched(&mut self, record: &CorrectionRecord, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            kind = %record.kind(),
            scope = %record.scope,
            target = %record.target_key,
            %reason,
            "Correction unmatched"
        );
        self.unmatched.push(UnmatchedReference {
            kind: record.kind(),
            scope: record.scope,
            target_key: record.target_key.clone(),
            reason,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedText {
    pub text: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResolution {
    pub category: Option<String>,
    pub source: Resolution,
}

/// `OBS.R01` → `OBS`
pub fn entity_prefix(entity_id: &str) -> &str {
    entity_id.split('.').next().unwrap_or(entity_id)
}

impl ResolutionContext {
    pub fn is_confirmed(&self, citation_id: &str) -> bool {
        self.corrections.device.iter().any(|r| {
            matches!(&r.payload, CorrectionPayload::Confirmation { citation_id: c } if c == citation_id)
        })
    }

    /// Device replacements keyed to `citation_id`, in append order
    pub fn text_replacements<'a>(&'a self, citation_id: &'a str) -> impl Iterator<Item = &'a CorrectionRecord> + 'a {
        self.corrections.device.iter().filter(move |r| {
            matches!(&r.payload, CorrectionPayload::TextReplacement { citation_id: Some(c), .. } if c == citation_id)
        })
    }

    /// Corrected text for one cited piece of text.
    ///
    /// Device replacements match by exact substring inside this citation's
    /// text only. A confirmed citation keeps its extracted text and skips the
    /// global rules.
    pub fn resolve_text(&self, citation_id: &str, original: &str, report: &mut RegenerationReport) -> ResolvedText {
        let mut text = original.to_string();

        let mut device_applied = false;
        for record in self.text_replacements(citation_id) {
            let CorrectionPayload::TextReplacement {
                original: from,
                corrected: to,
                ..
            } = &record.payload
            else {
                continue;
            };
            if text.contains(from.as_str()) {
                text = text.replace(from.as_str(), to);
                report.applied(record, Some(citation_id));
                device_applied = true;
            } else {
                report.unmatched(record, format!("'{}' not found in {}", from, citation_id));
            }
        }
        if device_applied {
            return ResolvedText {
                text,
                resolution: Resolution::Device,
            };
        }

        if self.is_confirmed(citation_id) {
            return ResolvedText {
                text,
                resolution: Resolution::Confirmed,
            };
        }

        let mut global_applied = false;
        for global in &self.global_text {
            if let Some(replaced) = global.rule.apply(&text) {
                text = replaced;
                global_applied = true;
                match &global.record {
                    Some(record) => report.applied(record, Some(citation_id)),
                    None => report.applied.push(AppliedCorrection {
                        kind: CorrectionKind::TextReplacement,
                        scope: Scope::Global,
                        target_key: global.rule.key().to_string(),
                        citation_id: Some(citation_id.to_string()),
                    }),
                }
            }
        }

        ResolvedText {
            text,
            resolution: if global_applied {
                Resolution::Global
            } else {
                Resolution::Original
            },
        }
    }

    pub fn resolve_category(&self, entity_id: &str) -> CategoryResolution {
        let prefix = entity_prefix(entity_id);
        let found = |category: &str, source: Resolution| CategoryResolution {
            category: Some(category.to_string()),
            source,
        };

        if let Some(category) = latest_category(&self.corrections.device, entity_id, prefix) {
            return found(category, Resolution::Device);
        }
        if let Some(category) = latest_category(&self.corrections.vendor, entity_id, prefix)
            .or_else(|| map_lookup(&self.vendor_map, entity_id, prefix))
        {
            return found(category, Resolution::Vendor);
        }
        if let Some(category) = latest_category(&self.corrections.standard, entity_id, prefix)
            .or_else(|| map_lookup(&self.standard_map, entity_id, prefix))
        {
            return found(category, Resolution::Standard);
        }
        for (pattern, record) in self.global_categories.iter().rev() {
            if let CorrectionPayload::CategoryOverride { category, .. } = &record.payload {
                if pattern.is_match(entity_id) {
                    return found(category, Resolution::Global);
                }
            }
        }

        CategoryResolution {
            category: None,
            source: Resolution::Original,
        }
    }

    /// Field overrides for an entity, merged so that higher scopes and
    /// later records overwrite per key. Returns the records that contributed.
    pub fn field_overrides(&self, entity_id: &str) -> (BTreeMap<String, serde_json::Value>, Vec<&CorrectionRecord>) {
        let prefix = entity_prefix(entity_id);
        let mut merged = BTreeMap::new();
        let mut used = Vec::new();

        for records in [
            &self.corrections.standard,
            &self.corrections.vendor,
            &self.corrections.device,
        ] {
            for record in records {
                if let CorrectionPayload::FieldOverride {
                    field_id,
                    overrides,
                } = &record.payload
                {
                    if field_id == entity_id || field_id == prefix {
                        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
                        used.push(record);
                    }
                }
            }
        }
        (merged, used)
    }
}

/// Latest category record for the exact id, else for the prefix
fn latest_category<'a>(records: &'a [CorrectionRecord], entity_id: &str, prefix: &str) -> Option<&'a str> {
    let lookup = |key: &str| {
        records.iter().rev().find_map(|r| match &r.payload {
            CorrectionPayload::CategoryOverride { prefix: p, category } if p == key => Some(category.as_str()),
            _ => None,
        })
    };
    lookup(entity_id).or_else(|| lookup(prefix))
}

fn map_lookup<'a>(map: &'a BTreeMap<String, String>, entity_id: &str, prefix: &str) -> Option<&'a str> {
    map.get(entity_id).or_else(|| map.get(prefix)).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrections::scope::{GlobalPattern, ScopeConfig};
    use crate::corrections::store::CorrectionSet;

    fn record(scope: Scope, owner: Option<&str>, payload: CorrectionPayload) -> CorrectionRecord {
        CorrectionRecord::new(scope, owner.map(str::to_string), payload, "")
    }

    fn category(scope: Scope, owner: Option<&str>, prefix: &str, category: &str) -> CorrectionRecord {
        record(
            scope,
            owner,
            CorrectionPayload::CategoryOverride {
                prefix: prefix.into(),
                category: category.into(),
            },
        )
    }

    fn global_zero_fix() -> ScopeConfig {
        ScopeConfig {
            global_patterns: vec![GlobalPattern {
                pattern: "0BS".into(),
                replacement: "OBS".into(),
                regex: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn vendor_beats_standard_for_same_prefix() {
        let set = CorrectionSet {
            vendor: vec![category(Scope::Vendor, Some("acme"), "OBS", "vendor-cat")],
            standard: vec![category(Scope::Standard, None, "OBS", "standard-cat")],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", Some("acme".into()), &ScopeConfig::default(), set).unwrap();
        let resolved = ctx.resolve_category("OBS.R01");
        assert_eq!(resolved.category.as_deref(), Some("vendor-cat"));
        assert_eq!(resolved.source, Resolution::Vendor);
    }

    #[test]
    fn yaml_vendor_map_beats_standard_record() {
        let mut config = ScopeConfig::default();
        config
            .vendors
            .insert("acme".into(), BTreeMap::from([("OBS".to_string(), "yaml-vendor".to_string())]));
        let set = CorrectionSet {
            standard: vec![category(Scope::Standard, None, "OBS", "standard-cat")],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", Some("acme".into()), &config, set).unwrap();
        assert_eq!(ctx.resolve_category("OBS.R01").category.as_deref(), Some("yaml-vendor"));
    }

    #[test]
    fn device_exact_id_beats_device_prefix_and_latest_wins() {
        let set = CorrectionSet {
            device: vec![
                category(Scope::Device, Some("dev-1"), "OBS", "prefix-cat"),
                category(Scope::Device, Some("dev-1"), "OBS.R01", "old"),
                category(Scope::Device, Some("dev-1"), "OBS.R01", "new"),
            ],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", None, &ScopeConfig::default(), set).unwrap();
        assert_eq!(ctx.resolve_category("OBS.R01").category.as_deref(), Some("new"));
        assert_eq!(ctx.resolve_category("OBS.R02").category.as_deref(), Some("prefix-cat"));
        assert_eq!(ctx.resolve_category("ORU.R01").source, Resolution::Original);
    }

    #[test]
    fn global_category_is_a_regex() {
        let set = CorrectionSet {
            global: vec![category(Scope::Global, None, r"^Z[A-Z]{2}\.", "custom")],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", None, &ScopeConfig::default(), set).unwrap();
        let resolved = ctx.resolve_category("ZDS.R01");
        assert_eq!(resolved.category.as_deref(), Some("custom"));
        assert_eq!(resolved.source, Resolution::Global);
    }

    #[test]
    fn device_replacement_is_scoped_to_its_citation() {
        let set = CorrectionSet {
            device: vec![record(
                Scope::Device,
                Some("dev-1"),
                CorrectionPayload::TextReplacement {
                    citation_id: Some("p1_txt1".into()),
                    original: "RO1".into(),
                    corrected: "R01".into(),
                },
            )],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", None, &ScopeConfig::default(), set).unwrap();
        let mut report = RegenerationReport::default();

        let hit = ctx.resolve_text("p1_txt1", "OBS.RO1 field", &mut report);
        assert_eq!(hit.text, "OBS.R01 field");
        assert_eq!(hit.resolution, Resolution::Device);

        let elsewhere = ctx.resolve_text("p1_txt2", "OBS.RO1 field", &mut report);
        assert_eq!(elsewhere.text, "OBS.RO1 field");
        assert_eq!(report.applied.len(), 1);
    }

    #[test]
    fn confirmation_blocks_global_rules() {
        let set = CorrectionSet {
            device: vec![record(
                Scope::Device,
                Some("dev-1"),
                CorrectionPayload::Confirmation {
                    citation_id: "p1_txt1".into(),
                },
            )],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", None, &global_zero_fix(), set).unwrap();
        let mut report = RegenerationReport::default();

        let confirmed = ctx.resolve_text("p1_txt1", "0BS.R01", &mut report);
        assert_eq!(confirmed.text, "0BS.R01");
        assert_eq!(confirmed.resolution, Resolution::Confirmed);

        let other = ctx.resolve_text("p1_txt2", "0BS.R01", &mut report);
        assert_eq!(other.text, "OBS.R01");
        assert_eq!(other.resolution, Resolution::Global);
    }

    #[test]
    fn missing_substring_is_reported_unmatched() {
        let set = CorrectionSet {
            device: vec![record(
                Scope::Device,
                Some("dev-1"),
                CorrectionPayload::TextReplacement {
                    citation_id: Some("p1_txt1".into()),
                    original: "nothing".into(),
                    corrected: "x".into(),
                },
            )],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", None, &global_zero_fix(), set).unwrap();
        let mut report = RegenerationReport::default();
        let resolved = ctx.resolve_text("p1_txt1", "0BS.R01", &mut report);
        // Falls through to the global rule
        assert_eq!(resolved.text, "OBS.R01");
        assert_eq!(report.unmatched.len(), 1);
    }

    #[test]
    fn field_overrides_merge_by_priority() {
        let override_of = |scope, owner: Option<&str>, key: &str, value: &str| {
            record(
                scope,
                owner,
                CorrectionPayload::FieldOverride {
                    field_id: "OBS".into(),
                    overrides: BTreeMap::from([(key.to_string(), serde_json::json!(value))]),
                },
            )
        };
        let set = CorrectionSet {
            device: vec![override_of(Scope::Device, Some("dev-1"), "length", "20")],
            standard: vec![
                override_of(Scope::Standard, None, "length", "10"),
                override_of(Scope::Standard, None, "usage", "R"),
            ],
            ..Default::default()
        };
        let ctx = ResolutionContext::new("dev-1", None, &ScopeConfig::default(), set).unwrap();
        let (merged, used) = ctx.field_overrides("OBS.R01");
        assert_eq!(merged["length"], "20");
        assert_eq!(merged["usage"], "R");
        assert_eq!(used.len(), 3);
    }
}
