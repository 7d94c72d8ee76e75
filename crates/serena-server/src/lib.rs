//! HTTP and WebSocket surface.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | Router, shared state, startup |
//! | `connection` | Per-socket inbound and outbound pumps |
//! | `frames` | Client frame decoding and live event encoding |
//! | `artifacts` | Artifact retrieval by URL |
//! | `warehouse` | Thin REST wrappers over the warehouse |

pub mod artifacts;
pub mod connection;
pub mod error;
pub mod frames;
pub mod server;
pub mod warehouse;

pub use artifacts::ArtifactOwners;
pub use error::{PumpError, ServerError};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use warehouse::WarehouseApi;
