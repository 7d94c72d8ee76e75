use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::base64_bytes;

/// Sentinel written in place of a filename when no artifact was stored.
pub const NOT_SAVED: &str = "No";

/// Result-map keys that together identify a stored artifact.
pub const KEY_APP_NAME: &str = "app_name";
pub const KEY_SESSION_ID: &str = "session_id";
pub const KEY_ARTIFACT_SAVED: &str = "artifact_saved";
pub const KEY_ARTIFACT_SIZE: &str = "artifact_size_bytes";

/// A named binary blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

impl Artifact {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pointer to an artifact produced by a tool run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub app_name: String,
    pub session_id: String,
    pub filename: String,
    pub size_bytes: u64,
}

impl ArtifactRef {
    /// Retrieval path served by the artifact endpoint.
    pub fn url(&self) -> String {
        artifact_url(&self.app_name, &self.session_id, &self.filename)
    }

    /// Detect an artifact reference inside a tool result map.
    ///
    /// All four keys must be present and `artifact_saved` must name a file
    /// rather than the [`NOT_SAVED`] sentinel.
    pub fn from_payload(payload: &Map<String, Value>) -> Option<Self> {
        let app_name = payload.get(KEY_APP_NAME)?.as_str()?;
        let session_id = payload.get(KEY_SESSION_ID)?.as_str()?;
        let filename = payload.get(KEY_ARTIFACT_SAVED)?.as_str()?;
        let size_bytes = payload.get(KEY_ARTIFACT_SIZE)?.as_u64()?;
        if filename.is_empty() || filename == NOT_SAVED {
            return None;
        }
        Some(Self {
            app_name: app_name.to_owned(),
            session_id: session_id.to_owned(),
            filename: filename.to_owned(),
            size_bytes,
        })
    }
}

pub fn artifact_url(app_name: &str, session_id: &str, filename: &str) -> String {
    format!("/artifacts/{app_name}/{session_id}/{filename}")
}
