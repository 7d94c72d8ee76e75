//! Startup validation. Any error here aborts the process before it binds.

use std::path::Path;

use crate::errors::{Result, SettingsError};
use crate::types::{ArtifactBackend, SerenaSettings};

impl SerenaSettings {
    /// Check every value the server needs before it starts.
    pub fn validate(&self) -> Result<()> {
        if self.gemini.api_key.trim().is_empty() {
            return Err(SettingsError::MissingValue("gemini.api_key"));
        }
        if self.gemini.base_url.trim().is_empty() {
            return Err(SettingsError::MissingValue("gemini.base_url"));
        }
        require_file("warehouse.path", &self.warehouse.path)?;
        require_file("warehouse.metadata_path", &self.warehouse.metadata_path)?;
        if self.warehouse.dataset.trim().is_empty() {
            return Err(SettingsError::MissingValue("warehouse.dataset"));
        }

        for (name, model) in [
            ("models.supervisor", &self.models.supervisor),
            ("models.chat", &self.models.chat),
            ("models.sql", &self.models.sql),
            ("models.visualization", &self.models.visualization),
            ("models.poster", &self.models.poster),
            ("models.email", &self.models.email),
            ("models.image", &self.models.image),
            ("models.speech", &self.models.speech),
            ("models.transcription", &self.models.transcription),
        ] {
            if model.trim().is_empty() {
                return Err(SettingsError::MissingValue(name));
            }
        }

        if self.runtime.tool_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "runtime.tool_timeout_secs must be positive".into(),
            ));
        }
        if self.runtime.audio_flush_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "runtime.audio_flush_ms must be positive".into(),
            ));
        }
        if self.artifacts.backend == ArtifactBackend::Sqlite
            && self.artifacts.sqlite_path.as_os_str().is_empty()
        {
            return Err(SettingsError::MissingValue("artifacts.sqlite_path"));
        }
        if self.artifacts.owners.is_empty() {
            return Err(SettingsError::MissingValue("artifacts.owners"));
        }
        Ok(())
    }
}

fn require_file(setting: &'static str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(SettingsError::MissingFile {
            setting,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn valid() -> (SerenaSettings, NamedTempFile, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let meta = NamedTempFile::new().unwrap();
        let mut settings = SerenaSettings::default();
        settings.gemini.api_key = "key".into();
        settings.warehouse.path = db.path().to_path_buf();
        settings.warehouse.metadata_path = meta.path().to_path_buf();
        (settings, db, meta)
    }

    #[test]
    fn complete_settings_pass() {
        let (settings, _db, _meta) = valid();
        settings.validate().unwrap();
    }

    #[test]
    fn missing_api_key_fails_fast() {
        let (mut settings, _db, _meta) = valid();
        settings.gemini.api_key = "   ".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::MissingValue("gemini.api_key"))
        ));
    }

    #[test]
    fn missing_warehouse_file_fails_fast() {
        let (mut settings, _db, _meta) = valid();
        settings.warehouse.path = "/no/such/warehouse.db".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::MissingFile { setting: "warehouse.path", .. })
        ));
    }

    #[test]
    fn empty_model_id_fails() {
        let (mut settings, _db, _meta) = valid();
        settings.models.image.clear();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::MissingValue("models.image"))
        ));
    }

    #[test]
    fn zero_timeout_fails() {
        let (mut settings, _db, _meta) = valid();
        settings.runtime.tool_timeout_secs = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }
}
