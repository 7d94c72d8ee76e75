//! Fixed per-tool rendering of tool results into the user-facing reply.

use serde_json::{Map, Value};

use serena_core::tools::{ToolKind, ToolResult};

use crate::pipeline::is_placeholder;

pub const EMAIL_SENT: &str = "The promotional email has been sent successfully.";

/// Rows shown in a query reply table.
const MAX_TABLE_ROWS: usize = 10;

/// The reply text for a tool result, or `None` when the artifact alone is
/// the response.
pub fn render(kind: ToolKind, result: &ToolResult) -> Option<String> {
    match kind {
        ToolKind::Conversation => Some(render_conversation(result)),
        ToolKind::Query => Some(render_query(result)),
        ToolKind::Visualization => render_artifact(result, "chart", "execution_summary"),
        ToolKind::Asset => render_artifact(result, "poster", "image_generation_summary"),
        ToolKind::Email => Some(render_email(result)),
    }
}

fn render_conversation(result: &ToolResult) -> String {
    match result.get_str("response") {
        Some(text) if !result.is_error && !text.trim().is_empty() => text.trim().to_string(),
        _ => format!(
            "Sorry, I couldn't answer that just now ({}).",
            result.error_message().unwrap_or("no response")
        ),
    }
}

fn render_query(result: &ToolResult) -> String {
    if let (true, Some(err)) = (result.is_error, result.error_message()) {
        return format!("I couldn't run that query: {err}");
    }

    let sql = ["reviewed_sql", "generated_sql"]
        .iter()
        .filter_map(|k| result.get_str(k))
        .find(|s| !is_placeholder(s));
    let sql_block = sql
        .map(|s| format!("\n\n```sql\n{}\n```", s.trim()))
        .unwrap_or_default();

    match result.payload.get("execution_result") {
        Some(Value::Array(rows)) => {
            let rows: Vec<&Map<String, Value>> = rows.iter().filter_map(Value::as_object).collect();
            let mut out = summary_sentence(&rows);
            out.push_str(&sql_block);
            if rows.len() > 1 || rows.first().is_some_and(|r| r.len() > 1) {
                out.push_str("\n\n");
                out.push_str(&markdown_table(&rows));
            }
            out
        }
        Some(Value::Object(obj)) => {
            let err = obj
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            format!("The query could not be executed: {err}{sql_block}")
        }
        _ => format!("The query was not executed.{sql_block}"),
    }
}

fn summary_sentence(rows: &[&Map<String, Value>]) -> String {
    match rows {
        [] => "The query returned no rows.".to_string(),
        [row] if row.len() == 1 => {
            let value = row.values().next().map(cell).unwrap_or_default();
            format!("The answer is {value}.")
        }
        [_] => "The query returned 1 row.".to_string(),
        _ => format!("The query returned {} rows.", rows.len()),
    }
}

/// Artifact tools reply with nothing when the artifact exists.
fn render_artifact(result: &ToolResult, what: &str, summary_key: &str) -> Option<String> {
    if result.artifact().is_some() {
        return None;
    }
    let reason = result
        .error_message()
        .or_else(|| result.get_str(summary_key))
        .unwrap_or("nothing was produced");
    Some(format!("I couldn't create the {what}: {reason}"))
}

fn render_email(result: &ToolResult) -> String {
    if !result.is_error && result.error_message().is_none() {
        return EMAIL_SENT.to_string();
    }
    format!(
        "The email could not be sent: {}",
        result.error_message().unwrap_or("unknown error")
    )
}

fn markdown_table(rows: &[&Map<String, Value>]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let columns: Vec<&String> = first.keys().collect();
    let mut out = String::new();
    out.push_str(&format!(
        "| {} |\n",
        columns.iter().map(|c| escape_cell(c)).collect::<Vec<_>>().join(" | ")
    ));
    out.push_str(&format!("|{}\n", " --- |".repeat(columns.len())));
    for row in rows.iter().take(MAX_TABLE_ROWS) {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| escape_cell(&row.get(*c).map(cell).unwrap_or_default()))
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    if rows.len() > MAX_TABLE_ROWS {
        out.push_str(&format!("\n({} more rows not shown)\n", rows.len() - MAX_TABLE_ROWS));
    }
    out.trim_end().to_string()
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
