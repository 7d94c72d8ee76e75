use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use serena_core::artifacts::Artifact;
use serena_core::ids::SessionKey;

use crate::error::StoreError;

/// Named binary blobs scoped to `(app, user, session)`.
///
/// Saving a filename that already exists replaces it; there is no
/// versioning.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(
        &self,
        scope: &SessionKey,
        filename: &str,
        artifact: Artifact,
    ) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing is stored under that exact name.
    async fn load(&self, scope: &SessionKey, filename: &str)
        -> Result<Option<Artifact>, StoreError>;

    async fn list_keys(&self, scope: &SessionKey) -> Result<BTreeSet<String>, StoreError>;
}

/// Filenames present in `after` but not in `before`.
pub fn new_artifacts(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Vec<String> {
    after.difference(before).cloned().collect()
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    scopes: DashMap<SessionKey, BTreeMap<String, Artifact>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save(
        &self,
        scope: &SessionKey,
        filename: &str,
        artifact: Artifact,
    ) -> Result<(), StoreError> {
        debug!(scope = %scope, filename, bytes = artifact.len(), "artifact saved");
        self.scopes
            .entry(scope.clone())
            .or_default()
            .insert(filename.to_string(), artifact);
        Ok(())
    }

    async fn load(
        &self,
        scope: &SessionKey,
        filename: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .scopes
            .get(scope)
            .and_then(|files| files.get(filename).cloned()))
    }

    async fn list_keys(&self, scope: &SessionKey) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .scopes
            .get(scope)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }
}
