//! Shared types for Serena: identifiers, model messages and streams, live
//! session events, the tool contract, and artifact references.

pub mod artifacts;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod state;
pub mod stream;
pub mod tools;

/// Synthetic user identity shared by every specialist pipeline.
pub const SYNTHETIC_USER_ID: &str = "dev_user_01";
