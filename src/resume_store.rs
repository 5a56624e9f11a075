use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::file::FileId;
use crate::retry::RetryState;

#[derive(Debug)]
pub struct StorageError(pub String);

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}
impl std::error::Error for StorageError {}

/// Pluggable key-value backend for persisted retry/resume state.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
}

/// In-memory fallback backend.
#[derive(Default)]
pub struct MemoryStorage {
    inner: StdMutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.inner.lock().unwrap().keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.lock().unwrap().clear();
        Ok(())
    }
}

/// Persists each key as a JSON file under `dir`, the same flat-file-on-disk
/// idiom `config.rs` uses for the application config (`fs::read_to_string` /
/// `serde_json` / `fs::write`), generalized to a key-value shape.
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl StorageProvider for JsonFileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(|e| StorageError(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError(e.to_string())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError(e.to_string()))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StorageError(e.to_string()))? {
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                keys.push(name.to_string());
            }
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for key in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRetryState {
    #[serde(flatten)]
    state: RetryState,
    timestamp: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

const DEFAULT_PREFIX: &str = "retry_";
const ACTIVE_UPLOADS_KEY: &str = "active_uploads";

/// Persists per-file `RetryState` and maintains the "active uploads" index.
pub struct ResumeStore {
    backend: Box<dyn StorageProvider>,
    prefix: String,
}

impl ResumeStore {
    pub fn new(backend: Box<dyn StorageProvider>) -> Self {
        Self {
            backend,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(backend: Box<dyn StorageProvider>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    fn key_for(&self, file_id: FileId) -> String {
        format!("{}{}", self.prefix, file_id)
    }

    fn active_key(&self) -> String {
        format!("{}{}", self.prefix, ACTIVE_UPLOADS_KEY)
    }

    pub async fn save(&self, state: &RetryState) -> Result<(), StorageError> {
        let wrapper = PersistedRetryState {
            state: state.clone(),
            timestamp: chrono::Utc::now(),
            expires_at: state.expires_at,
        };
        let json = serde_json::to_string(&wrapper).map_err(|e| StorageError(e.to_string()))?;
        self.backend.set(&self.key_for(state.file_id), &json).await?;
        self.add_to_active_index(state.file_id).await
    }

    pub async fn load(&self, file_id: FileId) -> Result<Option<RetryState>, StorageError> {
        let Some(json) = self.backend.get(&self.key_for(file_id)).await? else {
            return Ok(None);
        };
        let wrapper: PersistedRetryState =
            serde_json::from_str(&json).map_err(|e| StorageError(e.to_string()))?;
        if chrono::Utc::now() > wrapper.expires_at {
            self.delete(file_id).await?;
            return Ok(None);
        }
        Ok(Some(wrapper.state))
    }

    pub async fn delete(&self, file_id: FileId) -> Result<(), StorageError> {
        self.backend.remove(&self.key_for(file_id)).await?;
        self.remove_from_active_index(file_id).await
    }

    pub async fn list_active(&self) -> Result<Vec<FileId>, StorageError> {
        Ok(self.read_active_index().await?.into_iter().map(FileId).collect())
    }

    /// Deletes any persisted state whose `expires_at` has passed. Called on
    /// store open.
    pub async fn cleanup_expired(&self) -> Result<u32, StorageError> {
        let mut removed = 0;
        for file_id in self.list_active().await? {
            if self.load(file_id).await?.is_none() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn read_active_index(&self) -> Result<Vec<u64>, StorageError> {
        match self.backend.get(&self.active_key()).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| StorageError(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn write_active_index(&self, ids: &[u64]) -> Result<(), StorageError> {
        let json = serde_json::to_string(ids).map_err(|e| StorageError(e.to_string()))?;
        self.backend.set(&self.active_key(), &json).await
    }

    async fn add_to_active_index(&self, file_id: FileId) -> Result<(), StorageError> {
        let mut ids = self.read_active_index().await?;
        if !ids.contains(&file_id.0) {
            ids.push(file_id.0);
        }
        self.write_active_index(&ids).await
    }

    async fn remove_from_active_index(&self, file_id: FileId) -> Result<(), StorageError> {
        let mut ids = self.read_active_index().await?;
        ids.retain(|id| *id != file_id.0);
        self.write_active_index(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_state(id: u64) -> RetryState {
        RetryState::new(FileId(id), "device".into(), "session".into(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn save_then_load_round_trips_before_expiry() {
        let store = ResumeStore::new(Box::new(MemoryStorage::new()));
        let state = sample_state(1);
        store.save(&state).await.unwrap();
        let loaded = store.load(FileId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.file_id, state.file_id);
        assert_eq!(loaded.device_id, state.device_id);
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_load() {
        let store = ResumeStore::new(Box::new(MemoryStorage::new()));
        let mut state = sample_state(2);
        state.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.save(&state).await.unwrap();
        let loaded = store.load(FileId(2)).await.unwrap();
        assert!(loaded.is_none());
        assert!(!store.list_active().await.unwrap().contains(&FileId(2)));
    }

    #[tokio::test]
    async fn active_index_tracks_save_and_delete() {
        let store = ResumeStore::new(Box::new(MemoryStorage::new()));
        store.save(&sample_state(3)).await.unwrap();
        store.save(&sample_state(4)).await.unwrap();
        let mut active = store.list_active().await.unwrap();
        active.sort_by_key(|f| f.0);
        assert_eq!(active, vec![FileId(3), FileId(4)]);

        store.delete(FileId(3)).await.unwrap();
        let active = store.list_active().await.unwrap();
        assert_eq!(active, vec![FileId(4)]);
    }
}
