//! Artifact integrity checks
//!
//! An artifact is intact when its source still hashes to its document id,
//! every page of the document is accounted for exactly once (extracted or
//! failed), and every citation id is issued once, indexed on the page that
//! issued it and referenced by exactly one block or OCR result.

use crate::citation::parse_citation_id;
use crate::storage::hash_file;
use crate::types::DocumentArtifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCheck {
    pub path: String,
    /// `None` when the source could not be read
    pub actual_hash: Option<String>,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageCoverage {
    pub page_count: u32,
    pub extracted: usize,
    pub failed: usize,
    pub missing: Vec<u32>,
    pub duplicated: Vec<u32>,
    pub out_of_range: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationCheck {
    pub indexed: usize,
    /// Issued to more than one block or OCR result
    pub duplicated: Vec<String>,
    /// Referenced but absent from the page index
    pub dangling: Vec<String>,
    /// Indexed but referenced by nothing
    pub orphaned: Vec<String>,
    /// Keyed, paged or named inconsistently with the page holding it
    pub misplaced: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub document_id: String,
    pub source: SourceCheck,
    pub pages: PageCoverage,
    pub citations: CitationCheck,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check `artifact` against the source at `source`, or at the artifact's
/// recorded source path when none is given.
pub fn verify_artifact(artifact: &DocumentArtifact, source: Option<&Path>) -> IntegrityReport {
    let source_path = source.unwrap_or_else(|| Path::new(&artifact.source_path));
    let mut issues = Vec::new();

    let source = check_source(artifact, source_path, &mut issues);
    let pages = check_pages(artifact, &mut issues);
    let citations = check_citations(artifact, &mut issues);

    let report = IntegrityReport {
        document_id: artifact.document_id.clone(),
        source,
        pages,
        citations,
        issues,
        checked_at: Utc::now(),
    };
    if report.is_intact() {
        info!(document_id = %report.document_id, "Artifact intact");
    } else {
        warn!(document_id = %report.document_id, issues = report.issues.len(), "Artifact failed integrity checks");
    }
    report
}

fn check_source(artifact: &DocumentArtifact, path: &Path, issues: &mut Vec<String>) -> SourceCheck {
    let actual_hash = match hash_file(path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            issues.push(format!("source unreadable: {e}"));
            None
        }
    };
    let verified = actual_hash
        .as_deref()
        .is_some_and(|hash| hash.eq_ignore_ascii_case(&artifact.document_id));
    if let (Some(hash), false) = (&actual_hash, verified) {
        issues.push(format!(
            "source hash {} does not match document id {}",
            hash, artifact.document_id
        ));
    }
    SourceCheck {
        path: path.display().to_string(),
        actual_hash,
        verified,
    }
}

fn check_pages(artifact: &DocumentArtifact, issues: &mut Vec<String>) -> PageCoverage {
    let mut seen: BTreeMap<u32, usize> = BTreeMap::new();
    let extracted = artifact.pages.iter().map(|p| p.page);
    let failed = artifact.failed_pages.iter().map(|p| p.page);
    for page in extracted.chain(failed) {
        *seen.entry(page).or_default() += 1;
    }

    let in_range = |page: &u32| (1..=artifact.page_count).contains(page);
    let coverage = PageCoverage {
        page_count: artifact.page_count,
        extracted: artifact.pages.len(),
        failed: artifact.failed_pages.len(),
        missing: (1..=artifact.page_count).filter(|p| !seen.contains_key(p)).collect(),
        duplicated: seen.iter().filter(|(_, n)| **n > 1).map(|(p, _)| *p).collect(),
        out_of_range: seen.keys().copied().filter(|p| !in_range(p)).collect(),
    };

    if !coverage.missing.is_empty() {
        issues.push(format!("pages missing: {:?}", coverage.missing));
    }
    if !coverage.duplicated.is_empty() {
        issues.push(format!("pages recorded more than once: {:?}", coverage.duplicated));
    }
    if !coverage.out_of_range.is_empty() {
        issues.push(format!(
            "pages outside 1..={}: {:?}",
            artifact.page_count, coverage.out_of_range
        ));
    }
    coverage
}

fn check_citations(artifact: &DocumentArtifact, issues: &mut Vec<String>) -> CitationCheck {
    let mut check = CitationCheck::default();
    let mut referenced: BTreeSet<&str> = BTreeSet::new();
    let mut indexed: BTreeSet<&str> = BTreeSet::new();

    for bundle in &artifact.pages {
        let ids = bundle
            .blocks
            .iter()
            .map(|b| b.citation_id.as_str())
            .chain(bundle.ocr_results.iter().map(|r| r.citation_id.as_str()));
        for id in ids {
            if !referenced.insert(id) {
                check.duplicated.push(id.to_string());
            }
            if !bundle.citation_index.contains_key(id) {
                check.dangling.push(id.to_string());
            }
        }

        for (key, citation) in &bundle.citation_index {
            check.indexed += 1;
            let named_page = parse_citation_id(key).map(|(page, _, _)| page);
            let consistent = *key == citation.citation_id
                && citation.page == bundle.page
                && named_page == Some(bundle.page);
            // A key indexed on two pages is misplaced on the second
            if !consistent || !indexed.insert(key.as_str()) {
                check.misplaced.push(key.clone());
            }
        }
    }

    for bundle in &artifact.pages {
        for key in bundle.citation_index.keys() {
            if !referenced.contains(key.as_str()) {
                check.orphaned.push(key.clone());
            }
        }
    }

    let findings = [
        ("citation ids issued more than once", &check.duplicated),
        ("citation ids missing from their page index", &check.dangling),
        ("indexed citations referenced by nothing", &check.orphaned),
        ("citations indexed inconsistently", &check.misplaced),
    ];
    for (label, ids) in findings {
        if !ids.is_empty() {
            issues.push(format!("{label}: {}", ids.join(", ")));
        }
    }
    check
}
