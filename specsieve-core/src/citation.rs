//! Citation identifiers
//!
//! Ids have the shape `p{page}_{abbrev}{index}` (for example `p3_tbl2`).
//! The index comes from a per-page, per-kind counter that advances at
//! discovery time, so two runs over the same input hand out the same ids in
//! the same order no matter how OCR work is scheduled.

use crate::types::{Citation, CitationSource};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static CITATION_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^p(\d+)_(txt|img|tbl|gfx|ocr)(\d+)$").unwrap());

/// Kind component of a citation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CitationKind {
    Text,
    Picture,
    Table,
    Graphics,
    Ocr,
}

impl CitationKind {
    pub fn abbrev(&self) -> &'static str {
        match self {
            CitationKind::Text => "txt",
            CitationKind::Picture => "img",
            CitationKind::Table => "tbl",
            CitationKind::Graphics => "gfx",
            CitationKind::Ocr => "ocr",
        }
    }

    pub fn from_abbrev(abbrev: &str) -> Option<Self> {
        match abbrev {
            "txt" => Some(CitationKind::Text),
            "img" => Some(CitationKind::Picture),
            "tbl" => Some(CitationKind::Table),
            "gfx" => Some(CitationKind::Graphics),
            "ocr" => Some(CitationKind::Ocr),
            _ => None,
        }
    }
}

/// Hands out citation ids for a single page of a single extraction run.
///
/// Counters start at 1 and only move forward; an id stays consumed even when
/// the block it was issued for is later discarded.
#[derive(Debug, Clone)]
pub struct CitationAllocator {
    page: u32,
    counters: BTreeMap<CitationKind, u32>,
}

impl CitationAllocator {
    pub fn new(page: u32) -> Self {
        Self {
            page,
            counters: BTreeMap::new(),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn next_citation_id(&mut self, kind: CitationKind) -> String {
        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        format_citation_id(self.page, kind, *counter)
    }

    /// Number of ids issued so far for `kind`
    pub fn issued(&self, kind: CitationKind) -> u32 {
        self.counters.get(&kind).copied().unwrap_or(0)
    }
}

pub fn format_citation_id(page: u32, kind: CitationKind, index: u32) -> String {
    format!("p{}_{}{}", page, kind.abbrev(), index)
}

/// Split a citation id back into (page, kind, index)
pub fn parse_citation_id(id: &str) -> Option<(u32, CitationKind, u32)> {
    let caps = CITATION_ID_REGEX.captures(id)?;
    let page = caps[1].parse().ok()?;
    let kind = CitationKind::from_abbrev(&caps[2])?;
    let index = caps[3].parse().ok()?;
    Some((page, kind, index))
}

/// Markdown footnote line pointing back at the cited region
pub fn citation_footnote(citation: &Citation) -> String {
    let source = match citation.source {
        CitationSource::Text => "text",
        CitationSource::Ocr => "ocr",
        CitationSource::Graphics => "graphics",
    };
    let mut line = format!(
        "[^{}]: Page {}, bbox {}, source {}",
        citation.citation_id, citation.page, citation.bbox, source
    );
    if let Some(confidence) = citation.confidence {
        line.push_str(&format!(", confidence {:.2}", confidence));
    }
    if let Some(file) = &citation.file_reference {
        line.push_str(&format!(", file {}", file));
    }
    line
}
