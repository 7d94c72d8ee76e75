use serena_core::errors::GatewayError;
use serena_core::tools::ToolError;
use serena_store::StoreError;

use crate::chart::ChartError;
use crate::delivery::DeliveryError;
use crate::warehouse::WarehouseError;

/// Failures that abort a pipeline run or a supervisor turn.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("turn aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}

/// Pipeline definitions rejected at build time.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline `{0}` has no stages")]
    Empty(String),

    #[error("stage `{stage}` writes `{key}`, already written by an earlier stage")]
    DuplicateOutput { stage: String, key: String },

    #[error("stage `{stage}` overwrites `{key}` without reading it first")]
    BlindOverwrite { stage: String, key: String },

    #[error("stage `{stage}` reads `{key}`, which no seed or earlier stage provides")]
    UnknownInput { stage: String, key: String },
}

/// A single stage failing. Recorded as the stage's output, never raised.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("missing input `{0}`")]
    MissingInput(String),

    #[error("model call failed: {0}")]
    Model(#[from] GatewayError),

    #[error("model returned no output")]
    EmptyOutput,

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("query failed: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("chart rendering failed: {0}")]
    Chart(#[from] ChartError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("artifact store failed: {0}")]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,
}
