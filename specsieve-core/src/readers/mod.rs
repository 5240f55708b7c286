//! Structure readers
//!
//! A structure reader is the boundary between a PDF and the block classifier.
//! It hands over, per page, the raw text spans, raster and vector regions and
//! any tables its own structural detector proposed, each with a bounding box.
//! It can also render a page region to a bitmap for OCR.
//!
//! ```text
//! PDF ──[backend]──> page markup ──[MarkupReader]──> RawPage ──> classifier
//!                                         │
//!                                         └─[PopplerRasterizer]──> Bitmap ──> OCR
//! ```

pub mod markup;
pub mod rasterizer;

use crate::error::OcrError;
use crate::types::{Bitmap, BoundingBox, RawPage};
use anyhow::Result;
use std::collections::BTreeMap;

pub use markup::{parse_markup, MarkupReader};
pub use rasterizer::PopplerRasterizer;

/// Per-page access to a document's raw structure
pub trait StructureReader: Send + Sync {
    fn page_count(&self) -> u32;

    /// Raw structure of one page (1-based)
    fn read_page(&self, page: u32) -> Result<RawPage>;

    /// Render a page region for OCR
    fn render_region(&self, page: u32, bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError>;

    /// Document-level metadata (title, producer, ...)
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Reader identifier for logging and block provenance
    fn name(&self) -> &str;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Renders regions of a PDF page to bitmaps
pub trait RegionRenderer: Send + Sync {
    fn render(&self, page: u32, bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError>;
}
