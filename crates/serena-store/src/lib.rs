//! Session and artifact storage.
//!
//! Both stores are traits injected into the engine at construction. The
//! in-memory backends live for the process; [`SqliteArtifactStore`] persists
//! artifacts when configured.

pub mod artifacts;
pub mod database;
pub mod error;
pub mod schema;
pub mod sessions;
pub mod sqlite_artifacts;

pub use artifacts::{new_artifacts, ArtifactStore, InMemoryArtifactStore};
pub use database::Database;
pub use error::StoreError;
pub use sessions::{InMemorySessionStore, RunGuard, SessionHandle, SessionStore};
pub use sqlite_artifacts::SqliteArtifactStore;
