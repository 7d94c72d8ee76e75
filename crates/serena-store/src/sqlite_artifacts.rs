use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use serena_core::artifacts::Artifact;
use serena_core::ids::SessionKey;

use crate::artifacts::ArtifactStore;
use crate::database::Database;
use crate::error::StoreError;

/// Artifact store persisted in SQLite, surviving restarts.
#[derive(Clone)]
pub struct SqliteArtifactStore {
    db: Database,
}

impl SqliteArtifactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    #[instrument(skip(self, artifact), fields(scope = %scope, bytes = artifact.len()))]
    async fn save(
        &self,
        scope: &SessionKey,
        filename: &str,
        artifact: Artifact,
    ) -> Result<(), StoreError> {
        let scope = scope.clone();
        let filename = filename.to_string();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO artifacts
                        (app_name, user_id, session_id, filename, mime_type, data, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        scope.app_name,
                        scope.user_id,
                        scope.session_id.as_str(),
                        filename,
                        artifact.mime_type,
                        artifact.data.as_ref(),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
        })
        .await
    }

    async fn load(
        &self,
        scope: &SessionKey,
        filename: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        let scope = scope.clone();
        let filename = filename.to_string();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let row = conn
                    .query_row(
                        "SELECT mime_type, data FROM artifacts
                         WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4",
                        rusqlite::params![
                            scope.app_name,
                            scope.user_id,
                            scope.session_id.as_str(),
                            filename
                        ],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
                    )
                    .optional()?;
                Ok(row.map(|(mime, data)| Artifact::new(mime, data)))
            })
        })
        .await
    }

    async fn list_keys(&self, scope: &SessionKey) -> Result<BTreeSet<String>, StoreError> {
        let scope = scope.clone();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT filename FROM artifacts
                     WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                )?;
                let names = stmt
                    .query_map(
                        rusqlite::params![scope.app_name, scope.user_id, scope.session_id.as_str()],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(names)
            })
        })
        .await
    }
}
