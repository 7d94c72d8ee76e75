//! Serena's orchestration engine.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `pipeline` | Sequential specialist pipelines over session state |
//! | `specialists` | The five tools and the pipelines behind them |
//! | `supervisor` | Per-turn routing, confirmation gate, result rendering |
//! | `live` | Queue-driven live session around the supervisor |
//! | `voice` | Transcription and speech synthesis |
//! | `warehouse` | Read-only SQL warehouse and schema metadata |
//! | `chart` | Declarative chart specs rendered to SVG |
//! | `delivery` | Outbound email |

pub mod chart;
pub mod delivery;
pub mod error;
pub mod live;
pub mod pipeline;
pub mod registry;
pub mod specialists;
pub mod supervisor;
pub mod voice;
pub mod warehouse;

pub use error::{EngineError, PipelineError, StageError};
pub use live::{LiveAgent, LiveConfig, LiveOptions, LiveSession};
pub use registry::ToolRegistry;
pub use specialists::{build_registry, SpecialistDeps, SpecialistModels, SqlPipelineConfig};
pub use supervisor::{Supervisor, SupervisorConfig, TurnOutcome};
pub use voice::{SpeechSynthesizer, Transcriber};
pub use warehouse::{SqliteWarehouse, Warehouse, WarehouseError};
