//! `GET /artifacts/{app_name}/{session_id}/{filename}`.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tracing::{instrument, warn};

use serena_core::ids::{SessionId, SessionKey};

use crate::error::ServerError;
use crate::server::AppState;

/// App name → the synthetic user id its pipeline runs as.
#[derive(Clone, Debug, Default)]
pub struct ArtifactOwners {
    owners: BTreeMap<String, String>,
}

impl ArtifactOwners {
    pub fn new(owners: BTreeMap<String, String>) -> Self {
        Self { owners }
    }

    pub fn owner(&self, app_name: &str) -> Option<&str> {
        self.owners.get(app_name).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for ArtifactOwners {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[instrument(skip(state))]
pub async fn get_artifact(
    State(state): State<AppState>,
    Path((app_name, session_id, filename)): Path<(String, String, String)>,
) -> Result<Response, ServerError> {
    let Some(user_id) = state.owners.owner(&app_name) else {
        warn!("artifact requested for unmapped app");
        return Err(ServerError::NotFound(format!("unknown app '{app_name}'")));
    };
    let scope = SessionKey::new(app_name.as_str(), user_id, SessionId::from_raw(session_id.as_str()));

    match state.artifacts.load(&scope, &filename).await {
        Ok(Some(artifact)) => {
            Ok(([(header::CONTENT_TYPE, artifact.mime_type)], artifact.data).into_response())
        }
        Ok(None) => Err(ServerError::NotFound(format!("artifact '{filename}' not found"))),
        Err(e) => {
            warn!(error = %e, "artifact load failed");
            Err(ServerError::Internal(format!("could not load artifact: {e}")))
        }
    }
}
