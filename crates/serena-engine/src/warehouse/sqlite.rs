use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{Row, Warehouse, WarehouseError};

static QUOTED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`(?:[^`.]+\.)+([^`.]+)`").unwrap());

/// Warehouse backed by a read-only SQLite file.
///
/// Model-written SQL uses warehouse-style qualified names
/// (`` `project.dataset.table` ``); those are reduced to the bare table name
/// before execution.
#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    names: Arc<QualifiedNames>,
    path: PathBuf,
    project: String,
    dataset: String,
}

impl SqliteWarehouse {
    pub fn open(
        path: &Path,
        project: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Result<Self, WarehouseError> {
        if !path.exists() {
            return Err(WarehouseError::Io(format!(
                "warehouse file not found: {}",
                path.display()
            )));
        }
        let project = project.into();
        let dataset = dataset.into();
        let names = QualifiedNames::new(&project, &dataset)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        info!(path = %path.display(), "warehouse opened read-only");
        Ok(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
            names: Arc::new(names),
            path: path.to_owned(),
            project,
            dataset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the blocking pool with the connection held.
    ///
    /// Dropping the returned future (tool deadline, cancelled stage) skips a
    /// call that has not started and interrupts one that is running, so the
    /// connection is released for the next caller.
    async fn blocking<T, F>(&self, f: F) -> Result<T, WarehouseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, WarehouseError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let call = Arc::new(Mutex::new(CallState::Queued));
        let mut guard = InterruptOnDrop {
            call: call.clone(),
            handle: self.interrupt.clone(),
            armed: true,
        };
        let joined = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            {
                let mut state = call.lock();
                if *state == CallState::Abandoned {
                    return Err(WarehouseError::Query("query abandoned before it started".into()));
                }
                *state = CallState::Running;
            }
            let out = f(&conn);
            *call.lock() = CallState::Finished;
            out
        })
        .await;
        guard.armed = false;
        joined?
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

struct InterruptOnDrop {
    call: Arc<Mutex<CallState>>,
    handle: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Held across the interrupt so the call cannot finish and let the
        // next statement start in between.
        let mut state = self.call.lock();
        match *state {
            CallState::Queued => *state = CallState::Abandoned,
            CallState::Running => {
                warn!("query abandoned while running, interrupting");
                self.handle.interrupt();
            }
            CallState::Finished | CallState::Abandoned => {}
        }
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn project(&self) -> &str {
        &self.project
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    #[instrument(skip(self, sql), fields(chars = sql.len()))]
    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        ensure_read_only(sql)?;
        let sql = self.names.normalize(sql);
        debug!(%sql, "executing query");

        let rows = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| c.to_string()).collect();
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut map = Row::new();
                    for (i, name) in columns.iter().enumerate() {
                        map.insert(name.clone(), to_json(row.get_ref(i)?));
                    }
                    out.push(map);
                }
                Ok(out)
            })
            .await;

        match &rows {
            Ok(r) => info!(rows = r.len(), "query executed"),
            Err(e) => warn!(error = %e, "query failed"),
        }
        rows
    }

    async fn list_tables(
        &self,
        project: &str,
        dataset: &str,
        max_results: usize,
    ) -> Result<Vec<String>, WarehouseError> {
        if !project.eq_ignore_ascii_case(&self.project) || !dataset.eq_ignore_ascii_case(&self.dataset)
        {
            warn!(project, dataset, "dataset not found");
            return Err(WarehouseError::NotFound(format!("dataset '{project}.{dataset}'")));
        }
        let limit = i64::try_from(max_results).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
                 ORDER BY name LIMIT ?1",
            )?;
            let names = stmt
                .query_map([limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }
}

/// A piece of SQL text: code, or a quoted literal including its quotes.
#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Code(&'a str),
    Literal(&'a str),
}

/// Split on `'...'` and `"..."` literals. A doubled quote inside a literal
/// is an escaped quote; an unterminated literal runs to the end.
fn segments(sql: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '\'' && c != '"' {
            continue;
        }
        if start < i {
            out.push(Segment::Code(&sql[start..i]));
        }
        let mut end = sql.len();
        while let Some((j, d)) = chars.next() {
            if d != c {
                continue;
            }
            if chars.peek().map(|&(_, n)| n) == Some(c) {
                chars.next();
                continue;
            }
            end = j + d.len_utf8();
            break;
        }
        out.push(Segment::Literal(&sql[i..end]));
        start = end;
    }
    if start < sql.len() {
        out.push(Segment::Code(&sql[start..]));
    }
    out
}

/// Accept a single `SELECT` or `WITH` statement.
fn ensure_read_only(sql: &str) -> Result<(), WarehouseError> {
    let body = sql.trim().trim_end_matches(';').trim();
    if body.is_empty() {
        return Err(WarehouseError::Rejected("empty statement".into()));
    }
    let separated = segments(body)
        .iter()
        .any(|s| matches!(s, Segment::Code(code) if code.contains(';')));
    if separated {
        return Err(WarehouseError::Rejected("multiple statements".into()));
    }
    let first = body
        .trim_start_matches('(')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if first != "SELECT" && first != "WITH" {
        return Err(WarehouseError::Rejected(format!(
            "only SELECT or WITH queries are allowed, got {first}"
        )));
    }
    Ok(())
}

/// Rewrites warehouse-qualified table names to bare SQLite table names.
struct QualifiedNames {
    prefixes: Vec<Regex>,
}

impl QualifiedNames {
    fn new(project: &str, dataset: &str) -> Result<Self, WarehouseError> {
        let prefixes = [format!("{project}.{dataset}."), format!("{dataset}.")]
            .iter()
            .map(|p| Regex::new(&format!(r"(?i)\b{}", regex::escape(p))))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| WarehouseError::Metadata(format!("unusable dataset name: {e}")))?;
        Ok(Self { prefixes })
    }

    /// Reduce `` `p.d.t` ``, `p.d.t` and `d.t` to the table name. Quoted
    /// literals are left as written.
    fn normalize(&self, sql: &str) -> String {
        segments(sql)
            .into_iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.to_string(),
                Segment::Code(code) => {
                    let mut out = QUOTED_PATH.replace_all(code, "`$1`").into_owned();
                    for re in &self.prefixes {
                        out = re.replace_all(&out, "").into_owned();
                    }
                    out
                }
            })
            .collect()
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}
