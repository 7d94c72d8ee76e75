use std::fmt::Write as _;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::WarehouseError;

/// Dataset description file: one entry per table with column annotations.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatasetDescription {
    #[serde(default)]
    pub tables: Vec<TableDescription>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TableDescription {
    #[serde(default = "unnamed_table")]
    pub table_name: String,
    #[serde(default = "no_description")]
    pub table_description: String,
    #[serde(default)]
    pub columns: Vec<ColumnDescription>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ColumnDescription {
    #[serde(default = "unnamed_column")]
    pub column_name: String,
    #[serde(default = "unknown_type")]
    pub column_type: String,
    #[serde(default = "no_description")]
    pub column_description: String,
    #[serde(default)]
    pub is_primary_key: bool,
    pub foreign_key: Option<ForeignKey>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ForeignKey {
    #[serde(default = "unknown_table")]
    pub reference_table: String,
    #[serde(default = "unknown_column")]
    pub reference_column: String,
}

fn unnamed_table() -> String {
    "Unnamed Table".into()
}
fn unnamed_column() -> String {
    "Unnamed Column".into()
}
fn unknown_type() -> String {
    "Unknown Type".into()
}
fn unknown_table() -> String {
    "Unknown Table".into()
}
fn unknown_column() -> String {
    "Unknown Column".into()
}
fn no_description() -> String {
    "No description available.".into()
}

impl DatasetDescription {
    /// One paragraph per table, separated by a blank line.
    pub fn to_paragraphs(&self) -> String {
        let paragraphs: Vec<String> = self.tables.iter().map(table_paragraph).collect();
        paragraphs.join("\n")
    }
}

fn table_paragraph(table: &TableDescription) -> String {
    let mut out = format!(
        "Table '{}': {}\nColumns:\n",
        table.table_name, table.table_description
    );
    for col in &table.columns {
        let _ = write!(
            out,
            "  - {} ({}): {}",
            col.column_name, col.column_type, col.column_description
        );
        if col.is_primary_key {
            out.push_str(" (Primary Key)");
        }
        if let Some(fk) = &col.foreign_key {
            let _ = write!(
                out,
                " (Foreign Key references {}.{})",
                fk.reference_table, fk.reference_column
            );
        }
        out.push('\n');
    }
    out
}

/// Read the dataset description and render it as prompt text.
pub fn load_paragraphs(path: &Path) -> Result<String, WarehouseError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| WarehouseError::Io(format!("{}: {e}", path.display())))?;
    let description: DatasetDescription =
        serde_json::from_str(&raw).map_err(|e| WarehouseError::Metadata(e.to_string()))?;
    info!(
        path = %path.display(),
        tables = description.tables.len(),
        "schema metadata loaded"
    );
    Ok(description.to_paragraphs())
}
