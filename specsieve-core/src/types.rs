use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ===== GEOMETRY =====
// PDF user-space coordinates in points, origin top-left, y growing downward.

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.1}, {:.1}, {:.1}, {:.1})",
            self.x0, self.y0, self.x1, self.y1
        )
    }
}

// ===== CITATIONS =====

/// Which extraction path produced a cited fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationSource {
    Text,
    Ocr,
    Graphics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Picture,
    Table,
    Graphics,
}

/// Binds a derived fact to its exact origin in the source document.
/// Created once during extraction, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub citation_id: String,
    pub page: u32,
    pub bbox: BoundingBox,
    pub source: CitationSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_reference: Option<String>,
}

// ===== BLOCKS =====

/// How a table block was recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableDetection {
    /// Structural candidate accepted as proposed by the reader
    Structural,
    /// Structural candidate rejected, rebuilt from the text spans inside it
    Clustered,
    /// Never proposed by the reader; found by the free-text sweep
    Sweep,
}

/// Per-kind payload of a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockPayload {
    Text {
        markdown_slice: String,
        content: String,
    },
    Picture {
        image_ref: String,
        origin: String,
    },
    Table {
        table_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rendered_table: Option<String>,
        detection: TableDetection,
    },
    Graphics {
        origin: String,
    },
}

/// A typed, geometrically located unit of extracted content.
/// The header (bbox + citation id) is shared by every kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub bbox: BoundingBox,
    pub citation_id: String,
    #[serde(flatten)]
    pub payload: BlockPayload,
}

impl Block {
    pub fn content_type(&self) -> ContentType {
        match self.payload {
            BlockPayload::Text { .. } => ContentType::Text,
            BlockPayload::Picture { .. } => ContentType::Picture,
            BlockPayload::Table { .. } => ContentType::Table,
            BlockPayload::Graphics { .. } => ContentType::Graphics,
        }
    }

    /// Text carried by the block, if any (text content or rendered table)
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            BlockPayload::Text { content, .. } => Some(content),
            BlockPayload::Table { rendered_table, .. } => rendered_table.as_deref(),
            _ => None,
        }
    }

    pub fn is_visual_region(&self) -> bool {
        matches!(
            self.payload,
            BlockPayload::Picture { .. } | BlockPayload::Graphics { .. }
        )
    }
}

// ===== OCR =====

/// Review bucket for a confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Rejected,
    Review,
    Accepted,
}

impl ConfidenceLevel {
    pub fn from_score(score: f32) -> Self {
        if score < 0.5 {
            ConfidenceLevel::Rejected
        } else if score < 0.8 {
            ConfidenceLevel::Review
        } else {
            ConfidenceLevel::Accepted
        }
    }
}

/// Stored only when aggregate confidence clears the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub bbox: BoundingBox,
    pub text: String,
    pub confidence: f32,
    pub confidence_level: ConfidenceLevel,
    pub engine: String,
    pub citation_id: String,
    /// Picture/graphics block the text was recognized from
    pub region_citation_id: String,
    /// Nearest caption-bearing text block, if the page has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_block_citation_id: Option<String>,
    pub language: String,
}

// ===== PAGES =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrGateStats {
    pub candidates: usize,
    pub skipped_text_overlap: usize,
    pub below_threshold: usize,
    pub engine_errors: usize,
    pub stored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub structural: usize,
    pub clustered: usize,
    pub sweep: usize,
    pub rejected: usize,
    pub deduplicated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub width: f32,
    pub height: f32,
    pub text_blocks: usize,
    pub picture_blocks: usize,
    pub table_blocks: usize,
    pub graphics_blocks: usize,
    /// Blocks whose bbox failed validation; their citation ids stay consumed
    pub discarded_invalid: usize,
    pub ocr: OcrGateStats,
    pub tables: TableStats,
}

/// Everything extracted from one page of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageBundle {
    pub page: u32,
    pub raw_text: String,
    pub blocks: Vec<Block>,
    pub ocr_results: Vec<OcrResult>,
    pub citation_index: BTreeMap<String, Citation>,
    pub metadata: PageMetadata,
}

impl PageBundle {
    pub fn citation(&self, citation_id: &str) -> Option<&Citation> {
        self.citation_index.get(citation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPage {
    pub page: u32,
    pub message: String,
}

/// Raw extraction artifact: written exactly once per document, never rewritten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentArtifact {
    /// sha256 of the source bytes
    pub document_id: String,
    pub source_path: String,
    pub page_count: u32,
    pub pages: Vec<PageBundle>,
    #[serde(default)]
    pub failed_pages: Vec<FailedPage>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl DocumentArtifact {
    pub fn citation(&self, citation_id: &str) -> Option<&Citation> {
        self.pages.iter().find_map(|p| p.citation(citation_id))
    }

    pub fn citation_count(&self) -> usize {
        self.pages.iter().map(|p| p.citation_index.len()).sum()
    }

    pub fn ocr_result_count(&self) -> usize {
        self.pages.iter().map(|p| p.ocr_results.len()).sum()
    }
}

// ===== RAW READER OUTPUT =====
// What a structure reader hands the classifier for one page.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSpan {
    pub text: String,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTextBlock {
    pub bbox: BoundingBox,
    pub spans: Vec<RawSpan>,
}

impl RawTextBlock {
    pub fn text(&self) -> String {
        self.spans
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Raster,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRegion {
    pub bbox: BoundingBox,
    pub kind: RegionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

/// Table proposed by the reader's structural detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCandidate {
    pub bbox: BoundingBox,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    pub page: u32,
    pub width: f32,
    pub height: f32,
    pub text_blocks: Vec<RawTextBlock>,
    pub regions: Vec<RawRegion>,
    pub table_candidates: Vec<TableCandidate>,
}

impl RawPage {
    pub fn spans(&self) -> impl Iterator<Item = &RawSpan> {
        self.text_blocks.iter().flat_map(|b| b.spans.iter())
    }
}

/// Encoded raster of a page region, as handed to the OCR engine
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    pub png: Vec<u8>,
    pub dpi: u32,
}
