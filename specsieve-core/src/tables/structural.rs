//! Structural validation of table grids.

use super::TableGrid;
use std::fmt;

/// Why a grid was not accepted as a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRejection {
    TooFewRows { rows: usize, min: usize },
    TooFewColumns { cols: usize, min: usize },
    /// Header-only or fully empty: no data row carries a non-empty cell
    NoDataCells,
}

impl fmt::Display for TableRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRejection::TooFewRows { rows, min } => {
                write!(f, "{} rows, need at least {}", rows, min)
            }
            TableRejection::TooFewColumns { cols, min } => {
                write!(f, "{} columns, need at least {}", cols, min)
            }
            TableRejection::NoDataCells => write!(f, "no data row has a non-empty cell"),
        }
    }
}

/// Accept a grid only with enough rows and columns and at least one
/// non-empty data cell below the header row.
pub fn validate_grid(grid: &TableGrid, min_rows: usize, min_cols: usize) -> Result<(), TableRejection> {
    let rows = grid.row_count();
    if rows < min_rows {
        return Err(TableRejection::TooFewRows {
            rows,
            min: min_rows,
        });
    }
    let cols = grid.column_count();
    if cols < min_cols {
        return Err(TableRejection::TooFewColumns {
            cols,
            min: min_cols,
        });
    }
    if !grid.has_data_cell() {
        return Err(TableRejection::NoDataCells);
    }
    Ok(())
}
