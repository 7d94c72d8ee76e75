//! Declarative chart specs and a fixed SVG renderer.
//!
//! The visualization model only ever produces a [`ChartSpec`]; rendering is
//! done here from that spec and the query rows. Nothing model-authored is
//! executed.

pub mod render;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::warehouse::Row;

pub use render::{render_svg, SVG_MIME};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Scatter,
    Pie,
}

impl ChartKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bar => "bar",
            Self::Line => "line",
            Self::Scatter => "scatter",
            Self::Pie => "pie",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChartSpec {
    pub kind: ChartKind,
    /// Category (or numeric x for scatter) column.
    pub x: String,
    /// Numeric measure column.
    pub y: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_label: Option<String>,
    /// `#rgb`/`#rrggbb` or a plain CSS color name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("invalid chart spec: {0}")]
    InvalidSpec(String),

    #[error("no data to chart: {0}")]
    NoData(String),

    #[error("column `{0}` is not in the query result")]
    MissingColumn(String),

    #[error("column `{column}` has a non-numeric value in row {row}")]
    NonNumeric { column: String, row: usize },
}

/// One plotted point: category label, optional numeric x, measure.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub label: String,
    pub x: Option<f64>,
    pub y: f64,
}

impl ChartSpec {
    pub fn from_value(value: &Value) -> Result<Self, ChartError> {
        let spec: Self = serde_json::from_value(value.clone())
            .map_err(|e| ChartError::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), ChartError> {
        if self.x.trim().is_empty() || self.y.trim().is_empty() {
            return Err(ChartError::InvalidSpec("x and y must name columns".into()));
        }
        if let Some(color) = &self.color {
            if !is_safe_color(color) {
                return Err(ChartError::InvalidSpec(format!("unsupported color `{color}`")));
            }
        }
        Ok(())
    }

    /// Pull the plotted points out of the rows, sorted when requested.
    pub fn points(&self, rows: &[Row]) -> Result<Vec<Point>, ChartError> {
        let first = rows
            .first()
            .ok_or_else(|| ChartError::NoData("query returned no rows".into()))?;
        for col in [&self.x, &self.y] {
            if !first.contains_key(col) {
                return Err(ChartError::MissingColumn(col.clone()));
            }
        }

        let mut points = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let xv = row.get(&self.x).unwrap_or(&Value::Null);
            let y = row.get(&self.y).and_then(as_number).ok_or_else(|| ChartError::NonNumeric {
                column: self.y.clone(),
                row: i,
            })?;
            let x = as_number(xv);
            if self.kind == ChartKind::Scatter && x.is_none() {
                return Err(ChartError::NonNumeric {
                    column: self.x.clone(),
                    row: i,
                });
            }
            points.push(Point {
                label: label_of(xv),
                x,
                y,
            });
        }

        if self.kind == ChartKind::Pie && points.iter().any(|p| p.y < 0.0) {
            return Err(ChartError::InvalidSpec("pie values must be non-negative".into()));
        }

        match self.sort {
            Some(SortOrder::Asc) => points.sort_by(|a, b| a.y.partial_cmp(&b.y).unwrap_or(Ordering::Equal)),
            Some(SortOrder::Desc) => points.sort_by(|a, b| b.y.partial_cmp(&a.y).unwrap_or(Ordering::Equal)),
            None => {}
        }
        Ok(points)
    }
}

/// Interpret a state value as query rows.
///
/// Accepts a JSON row array (or its string form); an `{"error": ..}` object or
/// a sentinel string yields `NoData` carrying the upstream text.
pub fn rows_from_value(value: &Value) -> Result<Vec<Row>, ChartError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map.clone()),
                other => Err(ChartError::NoData(format!("row is not an object: {other}"))),
            })
            .collect(),
        Value::Object(map) => Err(ChartError::NoData(
            map.get("error")
                .and_then(Value::as_str)
                .unwrap_or("query result is not a row list")
                .to_string(),
        )),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ (Value::Array(_) | Value::Object(_))) => rows_from_value(&parsed),
            _ => Err(ChartError::NoData(s.clone())),
        },
        _ => Err(ChartError::NoData("query result is empty".into())),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn label_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "(null)".into(),
        other => other.to_string(),
    }
}

fn is_safe_color(color: &str) -> bool {
    if let Some(hex) = color.strip_prefix('#') {
        return matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    !color.is_empty() && color.len() <= 32 && color.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(v: Value) -> Vec<Row> {
        rows_from_value(&v).unwrap()
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ChartSpec::from_value(&json!({
            "kind": "bar", "x": "a", "y": "b", "title": "t", "code": "fig = go.Figure()"
        }))
        .unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(m) if m.contains("code")));
    }

    #[test]
    fn unsafe_color_is_rejected() {
        let err = ChartSpec::from_value(&json!({
            "kind": "bar", "x": "a", "y": "b", "title": "t", "color": "red\"/><script>"
        }))
        .unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)));
        assert!(ChartSpec::from_value(&json!({
            "kind": "pie", "x": "a", "y": "b", "title": "t", "color": "#1a73e8"
        }))
        .is_ok());
    }

    #[test]
    fn points_sort_and_coerce_numeric_strings() {
        let spec = ChartSpec::from_value(&json!({
            "kind": "bar", "x": "product", "y": "units", "title": "Top", "sort": "desc"
        }))
        .unwrap();
        let data = rows(json!([
            {"product": "Socks", "units": "3"},
            {"product": "Hats", "units": 9},
        ]));
        let points = spec.points(&data).unwrap();
        assert_eq!(points[0].label, "Hats");
        assert_eq!(points[1].y, 3.0);
    }

    #[test]
    fn missing_column_and_non_numeric_measure() {
        let spec = ChartSpec::from_value(&json!({"kind": "line", "x": "day", "y": "sales", "title": "t"})).unwrap();
        let err = spec.points(&rows(json!([{"day": "Mon"}]))).unwrap_err();
        assert!(matches!(err, ChartError::MissingColumn(c) if c == "sales"));
        let err = spec
            .points(&rows(json!([{"day": "Mon", "sales": "lots"}])))
            .unwrap_err();
        assert!(matches!(err, ChartError::NonNumeric { row: 0, .. }));
    }

    #[test]
    fn upstream_error_is_no_data() {
        let err = rows_from_value(&json!({"error": "Table not found: customer"})).unwrap_err();
        assert!(matches!(err, ChartError::NoData(m) if m.contains("customer")));
        let err = rows_from_value(&json!("Not executed.")).unwrap_err();
        assert!(matches!(err, ChartError::NoData(m) if m == "Not executed."));
        let parsed = rows_from_value(&json!("[{\"a\": 1}]")).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
