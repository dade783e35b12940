//! Output formatting for the command-line front end.
//!
//! Renders a `ResultTable` as an ASCII table (like the MySQL CLI), a Markdown
//! table, or JSON. Widths are measured in terminal columns, so wide characters
//! line up.

use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use unicode_width::UnicodeWidthStr;

use crate::config::OutputFormat;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnDescriptor, HostValue, ResultTable};

pub fn format_value(value: &HostValue) -> String {
    value.to_string()
}

fn is_numeric(value: &HostValue) -> bool {
    matches!(
        value,
        HostValue::Integer(_) | HostValue::BigInteger(_) | HostValue::Float(_) | HostValue::Decimal(_)
    )
}

fn pad(text: &str, width: usize, right_align: bool) -> String {
    let fill = " ".repeat(width.saturating_sub(text.width()));
    if right_align {
        format!("{}{}", fill, text)
    } else {
        format!("{}{}", text, fill)
    }
}

fn center(text: &str, width: usize) -> String {
    let total = width.saturating_sub(text.width());
    let left = total / 2;
    format!("{}{}{}", " ".repeat(left), text, " ".repeat(total - left))
}

/// Render a result in the requested format.
pub fn format_result(table: &ResultTable, format: OutputFormat, elapsed: Duration) -> DbResult<String> {
    match format {
        OutputFormat::Table => Ok(format_as_table(table, elapsed)),
        OutputFormat::Markdown => Ok(format_as_markdown(table)),
        OutputFormat::Json => format_as_json(table),
    }
}

pub fn format_as_table(table: &ResultTable, elapsed: Duration) -> String {
    if table.columns.is_empty() {
        return "Empty set".to_string();
    }

    let cells: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|row| row.iter().map(format_value).collect())
        .collect();

    let mut widths: Vec<usize> = table.columns.iter().map(|c| c.name.width()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.width());
            }
        }
    }

    let mut output = String::new();
    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    output.push_str(&separator);
    let header: String = table
        .columns
        .iter()
        .zip(&widths)
        .map(|(col, w)| format!("| {} ", center(&col.name, *w)))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);
    output.push_str(&separator);

    for (row, values) in cells.iter().zip(&table.rows) {
        let line: String = row
            .iter()
            .zip(values)
            .zip(&widths)
            .map(|((cell, value), w)| format!("| {} ", pad(cell, *w, is_numeric(value))))
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&separator);

    let count = table.row_count();
    let row_text = if count == 1 { "row" } else { "rows" };
    output.push_str(&format!(
        "{} {} in set ({:.2} sec)\n",
        count,
        row_text,
        elapsed.as_secs_f64()
    ));
    if table.truncated {
        output.push_str("(result truncated)\n");
    }

    output
}

pub fn format_as_markdown(table: &ResultTable) -> String {
    if table.columns.is_empty() {
        return "*Empty set*".to_string();
    }

    let mut output = String::new();

    let header: String = table
        .columns
        .iter()
        .map(|c| format!("| {} ", c.name))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);

    let sep: String = table.columns.iter().map(|_| "|---").collect::<String>() + "|\n";
    output.push_str(&sep);

    for row in &table.rows {
        let line: String = row
            .iter()
            .map(|value| format!("| {} ", format_value(value).replace('|', "\\|")))
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&format!("\n*{} rows*", table.row_count()));

    output
}

pub fn format_as_json(table: &ResultTable) -> DbResult<String> {
    let body = json!({
        "columns": table.column_names(),
        "rows": table.records_json(),
        "row_count": table.row_count(),
        "truncated": table.truncated,
    });
    to_pretty_json(&body)
}

/// Build a text table from ad-hoc rows, e.g. schema listings.
pub fn listing(headers: &[&str], rows: Vec<Vec<HostValue>>) -> ResultTable {
    let mut table = ResultTable::new(
        headers
            .iter()
            .enumerate()
            .map(|(i, h)| ColumnDescriptor::new(*h, i + 1, "VARCHAR"))
            .collect(),
    );
    table.rows = rows;
    table
}

/// Pretty JSON for any serializable descriptor list.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> DbResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| DbError::internal(format!("Failed to serialize output: {}", e)))
}
