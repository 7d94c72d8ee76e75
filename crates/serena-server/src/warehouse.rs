//! Thin REST wrappers over the warehouse, independent of the agent.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use serena_engine::Warehouse;

use crate::error::ServerError;
use crate::server::AppState;

#[derive(Clone)]
pub struct WarehouseApi {
    pub warehouse: Arc<dyn Warehouse>,
    /// Page size when the caller gives none.
    pub max_results: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListTablesParams {
    pub dataset_project: Option<String>,
    pub dataset_id: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTablesResponse {
    pub project: String,
    pub dataset_id: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRow {
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub rows: Vec<QueryRow>,
    pub row_count: usize,
}

#[instrument(skip(state))]
pub async fn list_tables(
    State(state): State<AppState>,
    Query(params): Query<ListTablesParams>,
) -> Result<Json<ListTablesResponse>, ServerError> {
    let api = &state.warehouse;
    let project = params
        .dataset_project
        .unwrap_or_else(|| api.warehouse.project().to_string());
    let dataset_id = params
        .dataset_id
        .unwrap_or_else(|| api.warehouse.dataset().to_string());
    let max_results = params.max_results.unwrap_or(api.max_results);

    let tables = api
        .warehouse
        .list_tables(&project, &dataset_id, max_results)
        .await?;
    Ok(Json(ListTablesResponse {
        project,
        dataset_id,
        tables,
    }))
}

#[instrument(skip_all)]
pub async fn run_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ServerError> {
    if request.query.trim().is_empty() {
        return Err(ServerError::BadRequest("query must not be empty".into()));
    }
    let rows = state.warehouse.warehouse.execute_query(&request.query).await?;
    let rows: Vec<QueryRow> = rows
        .into_iter()
        .map(|row| QueryRow {
            data: Value::Object(row),
        })
        .collect();
    Ok(Json(QueryResponse {
        row_count: rows.len(),
        rows,
    }))
}
