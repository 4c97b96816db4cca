//! Per-project persisted settings
//!
//! Holds the random token ManagedRelay mixes into derived subdomains so
//! the same project keeps the same public URL across runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, TunnelError};

/// Directory (inside the project root) holding devtunnel state
pub const SETTINGS_DIR: &str = ".devtunnel";
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_randomness: Option<String>,
}

/// Fields to change; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub url_randomness: Option<String>,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn read(&self, project_root: &Path) -> Result<ProjectSettings>;
    async fn write(&self, project_root: &Path, patch: SettingsPatch) -> Result<()>;
}

/// JSON file store at `<project>/.devtunnel/settings.json`
#[derive(Default)]
pub struct FileSettingsStore {
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings_path(project_root: &Path) -> PathBuf {
        project_root.join(SETTINGS_DIR).join(SETTINGS_FILE)
    }

    async fn read_raw(path: &Path) -> Result<Map<String, Value>> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Map::new()),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => Ok(map),
                _ => Err(TunnelError::Settings(format!(
                    "{} does not contain a JSON object",
                    path.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(TunnelError::Settings(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn read(&self, project_root: &Path) -> Result<ProjectSettings> {
        let raw = Self::read_raw(&Self::settings_path(project_root)).await?;
        Ok(serde_json::from_value(Value::Object(raw))?)
    }

    async fn write(&self, project_root: &Path, patch: SettingsPatch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = Self::settings_path(project_root);

        // Merge so keys written by other tools survive
        let mut raw = Self::read_raw(&path).await?;
        if let Some(randomness) = patch.url_randomness {
            raw.insert("urlRandomness".to_string(), Value::String(randomness));
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                TunnelError::Settings(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        let body = serde_json::to_vec_pretty(&Value::Object(raw))?;
        tokio::fs::write(&path, body).await.map_err(|e| {
            TunnelError::Settings(format!("failed to write {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "Wrote project settings");
        Ok(())
    }
}

/// In-memory store for tests and embedders without a writable project
#[derive(Default)]
pub struct MemorySettingsStore {
    entries: RwLock<HashMap<PathBuf, ProjectSettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn read(&self, project_root: &Path) -> Result<ProjectSettings> {
        Ok(self
            .entries
            .read()
            .await
            .get(project_root)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, project_root: &Path, patch: SettingsPatch) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(project_root.to_path_buf()).or_default();
        if let Some(randomness) = patch.url_randomness {
            entry.url_randomness = Some(randomness);
        }
        Ok(())
    }
}
