//! Output formatting
//!
//! Everything a command prints goes through [`Printer`], which renders any
//! serializable value as JSON, YAML or a plain table.

use anyhow::Result;
use colored::*;
use flint_core::format::truncate;
use flint::OutputFormat;
use serde::Serialize;
use serde_json::Value;

const MAX_CELL_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy)]
pub struct Printer {
    format: OutputFormat,
}

impl Printer {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_table(&self) -> bool {
        self.format == OutputFormat::Table
    }

    pub fn print<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let rendered = render(value, self.format)?;
        println!("{}", rendered.trim_end());
        Ok(())
    }
}

/// Render `value` in the given format
pub fn render<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Table => render_table(&serde_json::to_value(value)?),
    })
}

/// Arrays of objects become one row per element; a single object becomes
/// key/value rows; anything else prints as text.
pub fn render_table(value: &Value) -> String {
    match value {
        Value::Array(rows) if rows.is_empty() => "(no results)".to_string(),
        Value::Array(rows) if rows.iter().all(Value::is_object) => {
            let mut columns: Vec<String> = Vec::new();
            for row in rows {
                if let Value::Object(map) = row {
                    for key in map.keys() {
                        if !columns.contains(key) {
                            columns.push(key.clone());
                        }
                    }
                }
            }
            let cells: Vec<Vec<String>> = rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c).map(cell_text).unwrap_or_default())
                        .collect()
                })
                .collect();
            grid(&columns, &cells)
        }
        Value::Array(items) => items.iter().map(cell_text).collect::<Vec<_>>().join("\n"),
        Value::Object(map) => {
            let width = map.keys().map(|k| k.len()).max().unwrap_or(0);
            map.iter()
                .map(|(k, v)| format!("{:width$}  {}", k, field_text(v), width = width))
                .collect::<Vec<_>>()
                .join("\n")
        }
        other => cell_text(other),
    }
}

fn grid(columns: &[String], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            rows.iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(c.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |cells: Vec<String>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:w$}", cell, w = w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(columns.iter().map(|c| c.to_uppercase()).collect())];
    out.extend(rows.iter().map(|r| line(r.clone())));
    out.join("\n")
}

fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(cell_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    };
    truncate(&text, MAX_CELL_WIDTH)
}

fn field_text(value: &Value) -> String {
    match value {
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        other => cell_text(other),
    }
}

pub fn success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", "!".yellow(), message);
}

pub fn info(message: &str) {
    println!("{} {}", "→".cyan(), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", "Error:".red().bold(), message);
}
