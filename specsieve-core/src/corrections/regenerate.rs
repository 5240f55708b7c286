//! Deterministic regeneration of derived outputs.
//!
//! `regenerate` reads the immutable artifact and a frozen resolution context
//! and nothing else: no clock, no filesystem, no hash-ordered maps. Two calls
//! with the same inputs serialize to the same bytes.

use super::records::{CorrectionPayload, Scope};
use super::resolver::{entity_prefix, CategoryResolution, RegenerationReport, Resolution};
use super::scope::ResolutionContext;
use crate::citation::citation_footnote;
use crate::retrieval::{ChunkMetadata, IndexEntry};
use crate::types::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Identifier shape for protocol entities, e.g. `OBS.R01`
static ENTITY_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Z0-9]{1,5}\.[A-Z0-9]{2,4}\b").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedPage {
    pub page: u32,
    /// Corrected markdown with footnotes for every cited region
    pub markdown: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedBlock {
    pub page: u32,
    pub content_type: ContentType,
    pub text: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEntity {
    pub entity_id: String,
    pub prefix: String,
    #[serde(flatten)]
    pub category: CategoryResolution,
    /// Citations whose corrected text mentions the entity, in document order
    pub citations: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Introduced by a correction rather than found in the text
    #[serde(default)]
    pub added: bool,
}

/// Everything regeneration derives for one device. Contains no timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedOutputs {
    pub device_id: String,
    pub document_id: String,
    pub pages: Vec<DerivedPage>,
    pub blocks: BTreeMap<String, DerivedBlock>,
    pub entities: BTreeMap<String, DerivedEntity>,
    pub index_source: Vec<IndexEntry>,
    pub report: RegenerationReport,
}

impl DerivedOutputs {
    /// Canonical serialization, stable across runs
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

struct Pass<'a> {
    document: &'a DocumentArtifact,
    ctx: &'a ResolutionContext,
    report: RegenerationReport,
    blocks: BTreeMap<String, DerivedBlock>,
    index_source: Vec<IndexEntry>,
    mentions: BTreeMap<String, Vec<String>>,
}

impl<'a> Pass<'a> {
    /// Resolve one cited piece of text and record it everywhere it feeds
    fn resolve(&mut self, page: u32, citation_id: &str, bbox: BoundingBox, content_type: ContentType, original: &str) -> String {
        let resolved = self.ctx.resolve_text(citation_id, original, &mut self.report);

        for found in ENTITY_ID_REGEX.find_iter(&resolved.text) {
            let citations = self.mentions.entry(found.as_str().to_string()).or_default();
            if citations.last().map(String::as_str) != Some(citation_id) {
                citations.push(citation_id.to_string());
            }
        }

        self.index_source.push(IndexEntry {
            text: resolved.text.clone(),
            metadata: ChunkMetadata {
                document_id: self.document.document_id.clone(),
                page,
                citation_id: citation_id.to_string(),
                bbox,
                content_type,
            },
        });
        self.blocks.insert(
            citation_id.to_string(),
            DerivedBlock {
                page,
                content_type,
                text: resolved.text.clone(),
                resolution: resolved.resolution,
            },
        );
        resolved.text
    }

    fn render_page(&mut self, bundle: &PageBundle) -> DerivedPage {
        let mut sections: Vec<String> = Vec::new();
        let mut cited: Vec<&str> = Vec::new();

        for block in &bundle.blocks {
            let id = block.citation_id.as_str();
            match &block.payload {
                BlockPayload::Text { content, .. } => {
                    let text = self.resolve(bundle.page, id, block.bbox, ContentType::Text, content);
                    sections.push(format!("{} [^{}]", text, id));
                    cited.push(id);
                }
                BlockPayload::Table { rendered_table, .. } => {
                    let original = rendered_table.as_deref().unwrap_or_default();
                    let text = self.resolve(bundle.page, id, block.bbox, ContentType::Table, original);
                    sections.push(format!("{}\n\n[^{}]", text, id));
                    cited.push(id);
                }
                BlockPayload::Picture { image_ref, .. } => {
                    sections.push(format!("![{}]({}) [^{}]", id, image_ref, id));
                    cited.push(id);
                }
                BlockPayload::Graphics { .. } => {}
            }

            for ocr in bundle.ocr_results.iter().filter(|o| o.region_citation_id == id) {
                if matches!(block.payload, BlockPayload::Graphics { .. }) {
                    cited.push(id);
                }
                let text = self.resolve(bundle.page, &ocr.citation_id, ocr.bbox, ContentType::Text, &ocr.text);
                sections.push(format!("> {} [^{}]", text, ocr.citation_id));
                cited.push(&ocr.citation_id);
            }
        }

        let footnotes: Vec<String> = cited
            .iter()
            .filter_map(|id| bundle.citation(id))
            .map(citation_footnote)
            .collect();

        let mut markdown = sections.join("\n\n");
        if !footnotes.is_empty() {
            markdown.push_str("\n\n");
            markdown.push_str(&footnotes.join("\n"));
        }
        DerivedPage {
            page: bundle.page,
            markdown,
        }
    }
}

/// Recompute derived outputs from the raw artifact plus corrections.
///
/// Corrections that point at citations or entities the document does not
/// contain are listed in the report as unmatched; they never stop the pass.
pub fn regenerate(document: &DocumentArtifact, ctx: &ResolutionContext) -> DerivedOutputs {
    let mut pass = Pass {
        document,
        ctx,
        report: RegenerationReport::default(),
        blocks: BTreeMap::new(),
        index_source: Vec::new(),
        mentions: BTreeMap::new(),
    };

    let pages: Vec<DerivedPage> = document.pages.iter().map(|b| pass.render_page(b)).collect();

    // Device records keyed to citations that produced no text
    let mut confirmed = BTreeSet::new();
    for record in &ctx.corrections.device {
        match &record.payload {
            CorrectionPayload::TextReplacement {
                citation_id: Some(citation_id),
                ..
            } => {
                if document.citation(citation_id).is_none() {
                    pass.report.unmatched(record, format!("citation {} not in document", citation_id));
                } else if !pass.blocks.contains_key(citation_id) {
                    pass.report.unmatched(record, format!("citation {} carries no text", citation_id));
                }
            }
            CorrectionPayload::Confirmation { citation_id } => {
                if document.citation(citation_id).is_some() {
                    confirmed.insert(citation_id.clone());
                } else {
                    pass.report.unmatched(record, format!("citation {} not in document", citation_id));
                }
            }
            _ => {}
        }
    }
    pass.report.confirmed = confirmed.into_iter().collect();

    let mut entities: BTreeMap<String, DerivedEntity> = pass
        .mentions
        .iter()
        .map(|(entity_id, citations)| {
            (
                entity_id.clone(),
                DerivedEntity {
                    entity_id: entity_id.clone(),
                    prefix: entity_prefix(entity_id).to_string(),
                    category: ctx.resolve_category(entity_id),
                    citations: citations.clone(),
                    fields: BTreeMap::new(),
                    description: None,
                    added: false,
                },
            )
        })
        .collect();

    for record in &ctx.corrections.device {
        let CorrectionPayload::AddedEntity {
            entity_id,
            category,
            description,
            citation_id,
        } = &record.payload
        else {
            continue;
        };

        let mut citations = Vec::new();
        if let Some(citation_id) = citation_id {
            if document.citation(citation_id).is_some() {
                citations.push(citation_id.clone());
            } else {
                pass.report.unmatched(record, format!("citation {} not in document", citation_id));
            }
        }

        let entity = entities.entry(entity_id.clone()).or_insert_with(|| DerivedEntity {
            entity_id: entity_id.clone(),
            prefix: entity_prefix(entity_id).to_string(),
            category: ctx.resolve_category(entity_id),
            citations: Vec::new(),
            fields: BTreeMap::new(),
            description: None,
            added: true,
        });
        for citation in citations {
            if !entity.citations.contains(&citation) {
                entity.citations.push(citation);
            }
        }
        entity.description = Some(description.clone());
        if let Some(category) = category {
            entity.category = CategoryResolution {
                category: Some(category.clone()),
                source: Resolution::Device,
            };
        }
        pass.report.applied(record, citation_id.as_deref());
    }

    // Category and field records that reached at least one entity
    let mut used_fields = BTreeSet::new();
    for entity in entities.values_mut() {
        let (fields, records) = ctx.field_overrides(&entity.entity_id);
        entity.fields = fields;
        for record in records {
            used_fields.insert((record.scope, record.target_key.clone()));
        }
    }
    for record in ctx.corrections.iter() {
        match &record.payload {
            CorrectionPayload::FieldOverride { field_id, .. } => {
                if used_fields.contains(&(record.scope, field_id.clone())) {
                    pass.report.applied(record, None);
                } else {
                    pass.report.unmatched(record, format!("no entity {}", field_id));
                }
            }
            CorrectionPayload::CategoryOverride { prefix, .. } => {
                let reached = entities.values().any(|e| {
                    e.category.source == Resolution::from(record.scope)
                        && (record.scope == Scope::Global || e.entity_id == *prefix || e.prefix == *prefix)
                });
                if reached {
                    pass.report.applied(record, None);
                } else {
                    pass.report.unmatched(record, format!("no entity matches {}", prefix));
                }
            }
            _ => {}
        }
    }

    DerivedOutputs {
        device_id: ctx.device_id.clone(),
        document_id: document.document_id.clone(),
        pages,
        blocks: pass.blocks,
        entities,
        index_source: pass.index_source,
        report: pass.report,
    }
}
