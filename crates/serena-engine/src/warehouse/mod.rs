//! Read-only access to the marketing data warehouse.

pub mod metadata;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use metadata::{load_paragraphs, DatasetDescription};
pub use sqlite::SqliteWarehouse;

/// One result row, column name to JSON value.
pub type Row = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Statement refused before execution (writes, multiple statements).
    #[error("statement rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Query(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid metadata: {0}")]
    Metadata(String),
}

impl From<rusqlite::Error> for WarehouseError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Query(e.to_string())
    }
}

impl From<tokio::task::JoinError> for WarehouseError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Query(format!("query task failed: {e}"))
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Configured project and dataset, used to seed SQL generation.
    fn project(&self) -> &str;
    fn dataset(&self) -> &str;

    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>, WarehouseError>;

    /// Table names of `project.dataset`, at most `max_results`.
    async fn list_tables(
        &self,
        project: &str,
        dataset: &str,
        max_results: usize,
    ) -> Result<Vec<String>, WarehouseError>;
}
