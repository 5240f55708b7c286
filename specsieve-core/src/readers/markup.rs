//! Page markup reader
//!
//! Parses the page-structured XHTML intermediate produced by PDF backends.
//!
//! The format includes:
//! - Page divs with data-page, data-width, data-height attributes
//! - Text blocks as `<p data-bbox>` holding `<span data-bbox>` runs
//! - Raster regions as `<img data-bbox data-ref>`
//! - Vector regions as `<path data-bbox>`
//! - Structural table candidates as `<table data-bbox>` with `<tr>`/`<td>` rows
//! - Document metadata in `<meta>` tags
//!
//! Bounding boxes are four whitespace-separated numbers: `x0 y0 x1 y1`.

use super::{RegionRenderer, StructureReader};
use crate::error::OcrError;
use crate::geometry;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

// Pre-compiled regexes for markup parsing
static PAGE_START_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<div class="page"([^>]*)>"#).unwrap());

static PAGE_TAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)</div>\s*(?:</body>\s*)?(?:</html>\s*)?$").unwrap());

static PARAGRAPH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<p(\s[^>]*)?>(.*?)</p>").unwrap());

static SPAN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<span(\s[^>]*)?>([^<]*)</span>").unwrap());

static IMG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<img(\s[^>]*?)/?>").unwrap());

static PATH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<path(\s[^>]*?)/?>").unwrap());

static TABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<table(\s[^>]*)?>(.*?)</table>").unwrap());

static ROW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tr[^>]*>(.*?)</tr>").unwrap());

static CELL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<t[dh][^>]*>(.*?)</t[dh]>").unwrap());

static ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).unwrap());

static META_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta\s+name="([^"]*)"[^>]*content="([^"]*)"[^>]*/?>"#).unwrap()
});

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// One page of markup, split out but not yet parsed
#[derive(Debug, Clone)]
struct PageMarkup {
    attrs: String,
    body: String,
}

/// A page runs from its opening tag to the next page's opening tag, so nested
/// divs inside a page never cut it short. The closing tag is stripped.
fn split_pages(markup: &str) -> Vec<PageMarkup> {
    let starts: Vec<(usize, usize, String)> = PAGE_START_REGEX
        .captures_iter(markup)
        .filter_map(|cap| {
            let tag = cap.get(0)?;
            Some((tag.start(), tag.end(), cap[1].to_string()))
        })
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, (_, body_start, attrs))| {
            let body_end = starts.get(i + 1).map_or(markup.len(), |next| next.0);
            let body = &markup[*body_start..body_end];
            let body = match PAGE_TAIL_REGEX.find(body) {
                Some(tail) => &body[..tail.start()],
                None => body,
            };
            PageMarkup {
                attrs: attrs.clone(),
                body: body.to_string(),
            }
        })
        .collect()
}

/// Structure reader over the page markup intermediate.
///
/// Pages are split up front but parsed on demand, so one malformed page fails
/// on its own without taking the rest of the document with it.
pub struct MarkupReader {
    pages: Vec<PageMarkup>,
    metadata: BTreeMap<String, String>,
    renderer: Option<Box<dyn RegionRenderer>>,
}

impl MarkupReader {
    pub fn from_markup(markup: &str) -> Result<Self> {
        let pages = split_pages(markup);

        if pages.is_empty() {
            return Err(anyhow!("markup contains no page divs"));
        }

        let metadata = META_REGEX
            .captures_iter(markup)
            .map(|cap| (cap[1].to_string(), unescape(&cap[2])))
            .collect();

        Ok(Self {
            pages,
            metadata,
            renderer: None,
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let markup = std::fs::read_to_string(path)
            .with_context(|| format!("reading markup {}", path.display()))?;
        Self::from_markup(&markup)
    }

    /// Attach a renderer used for OCR region rasterization
    pub fn with_renderer(mut self, renderer: Box<dyn RegionRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }
}

impl StructureReader for MarkupReader {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn read_page(&self, page: u32) -> Result<RawPage> {
        let index = page
            .checked_sub(1)
            .ok_or_else(|| anyhow!("page numbers start at 1"))? as usize;
        let markup = self
            .pages
            .get(index)
            .ok_or_else(|| anyhow!("page {} out of range ({} pages)", page, self.pages.len()))?;
        parse_page(page, markup).with_context(|| format!("parsing page {}", page))
    }

    fn render_region(&self, page: u32, bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError> {
        match &self.renderer {
            Some(renderer) => renderer.render(page, bbox, dpi),
            None => Err(OcrError::BackendNotAvailable(
                "no renderer attached to markup reader".to_string(),
            )),
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.clone()
    }

    fn name(&self) -> &str {
        "markup"
    }

    fn is_healthy(&self) -> bool {
        !self.pages.is_empty()
    }
}

/// Parse a complete markup document into raw pages.
/// Fails on the first malformed page.
pub fn parse_markup(markup: &str) -> Result<Vec<RawPage>> {
    let reader = MarkupReader::from_markup(markup)?;
    (1..=reader.page_count())
        .map(|page| reader.read_page(page))
        .collect()
}

fn parse_page(page: u32, markup: &PageMarkup) -> Result<RawPage> {
    let attrs = parse_attrs(&markup.attrs);
    if let Some(declared) = attrs.get("data-page") {
        let declared: u32 = declared
            .parse()
            .map_err(|_| anyhow!("invalid data-page value {:?}", declared))?;
        if declared != page {
            return Err(anyhow!("page div declares page {} at position {}", declared, page));
        }
    }
    let width = parse_optional_f32(attrs.get("data-width"))?.unwrap_or(0.0);
    let height = parse_optional_f32(attrs.get("data-height"))?.unwrap_or(0.0);

    // Tables are cut out first so their cells are not read as free text
    let mut table_candidates = Vec::new();
    for cap in TABLE_REGEX.captures_iter(&markup.body) {
        let table_attrs = parse_attrs(cap.get(1).map_or("", |m| m.as_str()));
        let bbox = required_bbox(&table_attrs, "table")?;
        let rows = ROW_REGEX
            .captures_iter(&cap[2])
            .map(|row| {
                CELL_REGEX
                    .captures_iter(&row[1])
                    .map(|cell| clean_text(&cell[1]))
                    .collect::<Vec<_>>()
            })
            .collect();
        table_candidates.push(TableCandidate { bbox, rows });
    }
    let body = TABLE_REGEX.replace_all(&markup.body, "");

    let mut text_blocks = Vec::new();
    for cap in PARAGRAPH_REGEX.captures_iter(&body) {
        let p_attrs = parse_attrs(cap.get(1).map_or("", |m| m.as_str()));
        let block_bbox = parse_optional_bbox(p_attrs.get("data-bbox"))?;

        let mut spans = Vec::new();
        for span_cap in SPAN_REGEX.captures_iter(&cap[2]) {
            let span_attrs = parse_attrs(span_cap.get(1).map_or("", |m| m.as_str()));
            let text = unescape(&span_cap[2]);
            if text.trim().is_empty() {
                continue;
            }
            let bbox = match parse_optional_bbox(span_attrs.get("data-bbox"))? {
                Some(b) => b,
                None => block_bbox.ok_or_else(|| anyhow!("span {:?} has no bbox", text))?,
            };
            spans.push(RawSpan { text, bbox });
        }

        if spans.is_empty() {
            continue;
        }
        let bbox = match block_bbox {
            Some(b) => b,
            None => geometry::merge(spans.iter().map(|s| &s.bbox))
                .ok_or_else(|| anyhow!("text block without geometry"))?,
        };
        text_blocks.push(RawTextBlock { bbox, spans });
    }

    // Raster and vector regions keep document order across both tags
    let mut regions: Vec<(usize, RawRegion)> = Vec::new();
    for cap in IMG_REGEX.captures_iter(&body) {
        let img_attrs = parse_attrs(&cap[1]);
        let bbox = required_bbox(&img_attrs, "img")?;
        let offset = cap.get(0).map_or(0, |m| m.start());
        regions.push((
            offset,
            RawRegion {
                bbox,
                kind: RegionKind::Raster,
                image_ref: img_attrs
                    .get("data-ref")
                    .or_else(|| img_attrs.get("src"))
                    .cloned(),
            },
        ));
    }
    for cap in PATH_REGEX.captures_iter(&body) {
        let path_attrs = parse_attrs(&cap[1]);
        let bbox = required_bbox(&path_attrs, "path")?;
        let offset = cap.get(0).map_or(0, |m| m.start());
        regions.push((
            offset,
            RawRegion {
                bbox,
                kind: RegionKind::Vector,
                image_ref: None,
            },
        ));
    }
    regions.sort_by_key(|(offset, _)| *offset);

    Ok(RawPage {
        page,
        width,
        height,
        text_blocks,
        regions: regions.into_iter().map(|(_, r)| r).collect(),
        table_candidates,
    })
}

fn parse_attrs(raw: &str) -> BTreeMap<String, String> {
    ATTR_REGEX
        .captures_iter(raw)
        .map(|cap| (cap[1].to_string(), unescape(&cap[2])))
        .collect()
}

fn parse_bbox(raw: &str) -> Result<BoundingBox> {
    let values: Vec<f32> = raw
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| anyhow!("invalid bbox {:?}: {}", raw, e))?;
    match values.as_slice() {
        [x0, y0, x1, y1] => Ok(BoundingBox::new(*x0, *y0, *x1, *y1)),
        _ => Err(anyhow!("bbox {:?} needs exactly four values", raw)),
    }
}

fn parse_optional_bbox(raw: Option<&String>) -> Result<Option<BoundingBox>> {
    raw.map(|r| parse_bbox(r)).transpose()
}

fn required_bbox(attrs: &BTreeMap<String, String>, tag: &str) -> Result<BoundingBox> {
    let raw = attrs
        .get("data-bbox")
        .ok_or_else(|| anyhow!("<{}> without data-bbox", tag))?;
    parse_bbox(raw)
}

fn parse_optional_f32(raw: Option<&String>) -> Result<Option<f32>> {
    raw.map(|r| {
        r.parse::<f32>()
            .map_err(|e| anyhow!("invalid number {:?}: {}", r, e))
    })
    .transpose()
}

fn clean_text(raw: &str) -> String {
    unescape(&TAG_REGEX.replace_all(raw, " "))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
