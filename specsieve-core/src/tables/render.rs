use super::TableGrid;

/// Render a grid as a markdown pipe table; short rows are padded
pub fn render_markdown(grid: &TableGrid) -> String {
    let cols = grid.column_count();
    if cols == 0 {
        return String::new();
    }

    let mut lines = Vec::with_capacity(grid.row_count() + 1);
    for (idx, row) in grid.rows().iter().enumerate() {
        let cells: Vec<String> = (0..cols)
            .map(|c| row.get(c).map(|s| escape_cell(s)).unwrap_or_default())
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));

        if idx == 0 {
            lines.push(format!("|{}|", vec!["---"; cols].join("|")));
        }
    }
    lines.join("\n")
}

fn escape_cell(cell: &str) -> String {
    cell.trim().replace('|', "\\|").replace('\n', " ")
}
