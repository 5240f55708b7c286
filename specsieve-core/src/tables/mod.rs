//! Table recovery
//!
//! Two strategies feed the same validation:
//! - Structural: candidates proposed by the structure reader, accepted as-is
//!   when they validate. A rejected candidate is rebuilt from the text spans
//!   inside its bbox by adaptive clustering.
//! - Sweep: the same clustering run over every span not inside an accepted
//!   table, to find tables the reader never proposed. Two-column runs that
//!   read as prose are skipped, and a sweep table whose bbox overlaps an
//!   accepted table is dropped.

pub mod clustering;
pub mod render;
pub mod structural;

use crate::geometry;
use crate::types::{BoundingBox, RawPage, RawSpan, TableDetection, TableStats};
use clustering::{cluster_grid, find_tables, ClusterSettings};
use structural::{validate_grid, TableRejection};
use tracing::debug;

pub use render::render_markdown;

/// Rows of cell text; the first row is the header
#[derive(Debug, Clone, PartialEq)]
pub struct TableGrid {
    rows: Vec<Vec<String>>,
}

impl TableGrid {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Widest row
    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Any non-empty cell below the header row
    pub fn has_data_cell(&self) -> bool {
        self.rows
            .iter()
            .skip(1)
            .flatten()
            .any(|cell| !cell.trim().is_empty())
    }
}

/// An accepted table, before it becomes a block
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTable {
    pub bbox: BoundingBox,
    pub grid: TableGrid,
    pub detection: TableDetection,
}

#[derive(Debug, Clone, Default)]
pub struct TableRecovery {
    pub tables: Vec<RecoveredTable>,
    pub stats: TableStats,
}

/// Runs both strategies over one page
pub struct TableDetector {
    settings: ClusterSettings,
    sweep: bool,
}

impl TableDetector {
    pub fn new(settings: ClusterSettings, sweep: bool) -> Self {
        Self { settings, sweep }
    }

    pub fn detect(&self, page: &RawPage) -> TableRecovery {
        let mut recovery = TableRecovery::default();
        let spans: Vec<&RawSpan> = page.spans().collect();

        for candidate in &page.table_candidates {
            if !geometry::validate(&candidate.bbox) {
                debug!(page = page.page, bbox = %candidate.bbox, "Table candidate has invalid bbox");
                recovery.stats.rejected += 1;
                continue;
            }

            let grid = TableGrid::new(candidate.rows.clone());
            let accepted = match self.validate(&grid) {
                Ok(()) => Some((grid, TableDetection::Structural)),
                Err(reason) => {
                    debug!(page = page.page, bbox = %candidate.bbox, %reason, "Structural table rejected, clustering its spans");
                    self.recluster(&candidate.bbox, &spans)
                        .map(|grid| (grid, TableDetection::Clustered))
                }
            };

            match accepted {
                Some((grid, detection)) => {
                    if overlaps_accepted(&candidate.bbox, &recovery.tables) {
                        recovery.stats.deduplicated += 1;
                        continue;
                    }
                    match detection {
                        TableDetection::Structural => recovery.stats.structural += 1,
                        _ => recovery.stats.clustered += 1,
                    }
                    recovery.tables.push(RecoveredTable {
                        bbox: candidate.bbox,
                        grid,
                        detection,
                    });
                }
                None => recovery.stats.rejected += 1,
            }
        }

        if self.sweep {
            self.sweep_unclaimed(page.page, &spans, &mut recovery);
        }
        recovery
    }

    fn validate(&self, grid: &TableGrid) -> Result<(), TableRejection> {
        validate_grid(grid, self.settings.min_rows, self.settings.min_cols)
    }

    /// Rebuild a rejected candidate from the spans whose centers fall inside it
    fn recluster(&self, bbox: &BoundingBox, spans: &[&RawSpan]) -> Option<TableGrid> {
        let region = geometry::expand(bbox, self.settings.row_tolerance);
        let inside: Vec<&RawSpan> = spans
            .iter()
            .copied()
            .filter(|s| center_inside(&s.bbox, &region))
            .collect();
        let (grid, _) = cluster_grid(&inside, &self.settings)?;
        match self.validate(&grid) {
            Ok(()) => Some(grid),
            Err(reason) => {
                debug!(bbox = %bbox, %reason, "Clustered table rejected");
                None
            }
        }
    }

    fn sweep_unclaimed(&self, page: u32, spans: &[&RawSpan], recovery: &mut TableRecovery) {
        let unclaimed: Vec<&RawSpan> = spans
            .iter()
            .copied()
            .filter(|s| {
                !recovery
                    .tables
                    .iter()
                    .any(|t| center_inside(&s.bbox, &t.bbox))
            })
            .collect();

        for (grid, bbox) in find_tables(&unclaimed, &self.settings) {
            if let Err(reason) = self.validate(&grid) {
                debug!(page, bbox = %bbox, %reason, "Sweep table rejected");
                recovery.stats.rejected += 1;
                continue;
            }
            if overlaps_accepted(&bbox, &recovery.tables) {
                debug!(page, bbox = %bbox, "Sweep table overlaps an accepted table, dropped");
                recovery.stats.deduplicated += 1;
                continue;
            }
            recovery.stats.sweep += 1;
            recovery.tables.push(RecoveredTable {
                bbox,
                grid,
                detection: TableDetection::Sweep,
            });
        }
    }
}

fn center_inside(inner: &BoundingBox, outer: &BoundingBox) -> bool {
    let (cx, cy) = inner.center();
    cx >= outer.x0 && cx <= outer.x1 && cy >= outer.y0 && cy <= outer.y1
}

fn overlaps_accepted(bbox: &BoundingBox, accepted: &[RecoveredTable]) -> bool {
    accepted.iter().any(|t| geometry::overlaps(bbox, &t.bbox))
}
