//! Adaptive text clustering for tables.
//!
//! Spans are grouped into rows by vertical tolerance, words within a row are
//! joined into fragments, and column boundaries come from the gaps between
//! the distinct fragment x-starts: a boundary goes wherever a gap exceeds
//! `max(multiplier * average_gap, floor)`.

use super::TableGrid;
use crate::geometry;
use crate::types::{BoundingBox, RawSpan};
use std::cmp::Ordering;

/// Starts closer than this are the same position
const X_START_EPSILON: f32 = 0.5;

/// Cells of at most this many words read as table cells, not prose
const SHORT_CELL_WORDS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ClusterSettings {
    /// Vertical tolerance in points for spans sharing a row
    pub row_tolerance: f32,
    /// Fixed noise floor for column gaps, in points
    pub gap_floor: f32,
    /// Multiple of the average gap that starts a new column
    pub gap_multiplier: f32,
    pub min_rows: usize,
    pub min_cols: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            row_tolerance: 5.0,
            gap_floor: 20.0,
            gap_multiplier: 1.5,
            min_rows: 2,
            min_cols: 2,
        }
    }
}

/// Contiguous run of words in one row
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub bbox: BoundingBox,
}

fn by_position(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0))
}

/// Group spans into rows: a span joins the current row while its top lies
/// within `tolerance` of the row's first span. Rows are sorted left to right.
pub fn group_rows<'a, I>(spans: I, tolerance: f32) -> Vec<Vec<&'a RawSpan>>
where
    I: IntoIterator<Item = &'a RawSpan>,
{
    let mut sorted: Vec<&RawSpan> = spans
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();
    sorted.sort_by(|a, b| by_position(&a.bbox, &b.bbox));

    let mut rows: Vec<Vec<&RawSpan>> = Vec::new();
    let mut anchor_y = f32::NEG_INFINITY;
    for span in sorted {
        match rows.last_mut() {
            Some(row) if (span.bbox.y0 - anchor_y).abs() <= tolerance => row.push(span),
            _ => {
                anchor_y = span.bbox.y0;
                rows.push(vec![span]);
            }
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
    }
    rows
}

/// Join neighbouring spans of a row whose horizontal gap is below `join_gap`
pub fn merge_fragments(row: &[&RawSpan], join_gap: f32) -> Vec<Fragment> {
    let mut fragments: Vec<Fragment> = Vec::new();
    for span in row {
        let text = span.text.trim();
        match fragments.last_mut() {
            Some(last) if span.bbox.x0 - last.bbox.x1 < join_gap => {
                last.text.push(' ');
                last.text.push_str(text);
                last.bbox = geometry::merge([&last.bbox, &span.bbox]).unwrap_or(last.bbox);
            }
            _ => fragments.push(Fragment {
                text: text.to_string(),
                bbox: span.bbox,
            }),
        }
    }
    fragments
}

/// Column boundaries (x positions where a new column starts) from a set of
/// x-starts.
///
/// When every gap clears the floor but none clears the adaptive threshold,
/// the starts are evenly spaced and each one begins its own column.
pub fn column_boundaries(x_starts: &[f32], multiplier: f32, floor: f32) -> Vec<f32> {
    let mut starts: Vec<f32> = x_starts.iter().copied().filter(|x| x.is_finite()).collect();
    starts.sort_by(|a, b| a.total_cmp(b));
    starts.dedup_by(|b, a| (*b - *a).abs() < X_START_EPSILON);

    if starts.len() < 2 {
        return Vec::new();
    }

    let gaps: Vec<f32> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    let average = gaps.iter().sum::<f32>() / gaps.len() as f32;
    let threshold = (multiplier * average).max(floor);

    let boundaries: Vec<f32> = gaps
        .iter()
        .enumerate()
        .filter(|(_, gap)| **gap > threshold)
        .map(|(i, _)| starts[i + 1])
        .collect();

    if boundaries.is_empty() && gaps.iter().all(|gap| *gap >= floor) {
        return starts[1..].to_vec();
    }
    boundaries
}

fn column_of(x: f32, boundaries: &[f32]) -> usize {
    boundaries
        .iter()
        .take_while(|b| x + X_START_EPSILON >= **b)
        .count()
}

/// Lay fragments out on a grid defined by `boundaries`
pub fn build_grid(rows: &[Vec<Fragment>], boundaries: &[f32]) -> TableGrid {
    let cols = boundaries.len() + 1;
    let grid = rows
        .iter()
        .map(|row| {
            let mut cells = vec![String::new(); cols];
            for fragment in row {
                let cell = &mut cells[column_of(fragment.bbox.x0, boundaries)];
                if !cell.is_empty() {
                    cell.push(' ');
                }
                cell.push_str(&fragment.text);
            }
            cells
        })
        .collect();
    TableGrid::new(grid)
}

/// Rows → fragments → boundaries → grid, in one step
pub fn cluster_grid(spans: &[&RawSpan], settings: &ClusterSettings) -> Option<(TableGrid, BoundingBox)> {
    let rows: Vec<Vec<Fragment>> = group_rows(spans.iter().copied(), settings.row_tolerance)
        .iter()
        .map(|row| merge_fragments(row, settings.gap_floor))
        .collect();
    grid_from_fragment_rows(&rows, settings)
}

fn grid_from_fragment_rows(
    rows: &[Vec<Fragment>],
    settings: &ClusterSettings,
) -> Option<(TableGrid, BoundingBox)> {
    let bbox = geometry::merge(rows.iter().flatten().map(|f| &f.bbox))?;
    let starts: Vec<f32> = rows.iter().flatten().map(|f| f.bbox.x0).collect();
    let boundaries = column_boundaries(&starts, settings.gap_multiplier, settings.gap_floor);
    Some((build_grid(rows, &boundaries), bbox))
}

/// Two consecutive rows plausibly belong to the same table: similar cell
/// counts and at least half of their x-starts aligned within the floor.
fn rows_compatible(a: &[Fragment], b: &[Fragment], floor: f32) -> bool {
    if a.len().abs_diff(b.len()) > 1 {
        return false;
    }
    let shared = a.len().min(b.len());
    let aligned = a
        .iter()
        .zip(b.iter())
        .filter(|(x, y)| (x.bbox.x0 - y.bbox.x0).abs() <= floor)
        .count();
    aligned * 2 >= shared
}

fn is_short_or_numeric(text: &str) -> bool {
    let words = text.split_whitespace().count();
    words <= SHORT_CELL_WORDS
        || text
            .chars()
            .filter(|c| !c.is_whitespace())
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+' | '%'))
}

/// Two-column regions are often prose set in columns. Three or more columns
/// always pass; two columns need at least half their cells short or numeric.
fn looks_tabular(region: &[Vec<Fragment>]) -> bool {
    let widest = region.iter().map(Vec::len).max().unwrap_or(0);
    if widest >= 3 {
        return true;
    }
    let cells: Vec<&Fragment> = region.iter().flatten().collect();
    let short = cells.iter().filter(|f| is_short_or_numeric(&f.text)).count();
    short * 2 >= cells.len()
}

/// Sweep free-standing spans for tables: runs of consecutive multi-cell rows
/// with compatible layouts that do not read as columned prose. Returns one
/// grid + bbox per run, top to bottom.
pub fn find_tables(spans: &[&RawSpan], settings: &ClusterSettings) -> Vec<(TableGrid, BoundingBox)> {
    let rows: Vec<Vec<Fragment>> = group_rows(spans.iter().copied(), settings.row_tolerance)
        .iter()
        .map(|row| merge_fragments(row, settings.gap_floor))
        .collect();

    let mut regions: Vec<Vec<Vec<Fragment>>> = Vec::new();
    let mut current: Vec<Vec<Fragment>> = Vec::new();
    for row in rows {
        let continues = row.len() >= settings.min_cols
            && current
                .last()
                .map_or(true, |prev| rows_compatible(prev, &row, settings.gap_floor));
        if continues {
            current.push(row);
            continue;
        }
        if current.len() >= settings.min_rows {
            regions.push(std::mem::take(&mut current));
        }
        current.clear();
        if row.len() >= settings.min_cols {
            current.push(row);
        }
    }
    if current.len() >= settings.min_rows {
        regions.push(current);
    }

    regions
        .iter()
        .filter(|region| looks_tabular(region))
        .filter_map(|region| grid_from_fragment_rows(region, settings))
        .collect()
}
