use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    dao::storage::{StorageError, StorageResult},
    dto::analytics::AnalyticsEvent,
};

/// Key under which the session identifier is kept.
pub const SESSION_KEY: &str = "cardsync_session_id";

/// Durable storage for analytics events that could not be delivered, and for the session
/// identifier that buckets this visitor into experiments.
pub trait EventStore: Send + Sync {
    /// Events stored under `key`; empty when nothing was stored.
    fn load(&self, key: &str) -> BoxFuture<'static, StorageResult<Vec<AnalyticsEvent>>>;
    /// Replace the events stored under `key`.
    fn save(&self, key: &str, events: Vec<AnalyticsEvent>) -> BoxFuture<'static, StorageResult<()>>;
    /// Drop everything stored under `key`.
    fn clear(&self, key: &str) -> BoxFuture<'static, StorageResult<()>>;
    /// Session identifier saved by an earlier run, if any.
    fn load_session(&self) -> BoxFuture<'static, StorageResult<Option<String>>>;
    /// Remember `session_id` for later runs.
    fn save_session(&self, session_id: &str) -> BoxFuture<'static, StorageResult<()>>;
}

/// Stores each key as a JSON array in `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileEventStore {
    dir: Arc<PathBuf>,
}

impl FileEventStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Parsed contents of `<key>.json`, or `None` when the file does not exist.
    fn read<T>(&self, key: &str) -> BoxFuture<'static, StorageResult<Option<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let path = self.path(key);
        let key = key.to_string();
        Box::pin(async move {
            let contents = match tokio::fs::read(&path).await {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(StorageError::unavailable(
                        format!("failed to read {}", path.display()),
                        err,
                    ));
                }
            };
            serde_json::from_slice(&contents)
                .map(Some)
                .map_err(|source| StorageError::Corrupt { key, source })
        })
    }

    fn write<T>(&self, key: &str, value: &T) -> BoxFuture<'static, StorageResult<()>>
    where
        T: Serialize + ?Sized,
    {
        let dir = self.dir.clone();
        let path = self.path(key);
        let payload = serde_json::to_vec(value).map_err(|source| StorageError::Corrupt {
            key: key.to_string(),
            source,
        });
        Box::pin(async move {
            let payload = payload?;
            tokio::fs::create_dir_all(dir.as_path()).await.map_err(|err| {
                StorageError::unavailable(format!("failed to create {}", dir.display()), err)
            })?;
            tokio::fs::write(&path, payload).await.map_err(|err| {
                StorageError::unavailable(format!("failed to write {}", path.display()), err)
            })
        })
    }
}

impl EventStore for FileEventStore {
    fn load(&self, key: &str) -> BoxFuture<'static, StorageResult<Vec<AnalyticsEvent>>> {
        let read = self.read::<Vec<AnalyticsEvent>>(key);
        Box::pin(async move { Ok(read.await?.unwrap_or_default()) })
    }

    fn save(&self, key: &str, events: Vec<AnalyticsEvent>) -> BoxFuture<'static, StorageResult<()>> {
        self.write(key, &events)
    }

    fn clear(&self, key: &str) -> BoxFuture<'static, StorageResult<()>> {
        let path = self.path(key);
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StorageError::unavailable(
                    format!("failed to remove {}", path.display()),
                    err,
                )),
            }
        })
    }

    fn load_session(&self) -> BoxFuture<'static, StorageResult<Option<String>>> {
        self.read(SESSION_KEY)
    }

    fn save_session(&self, session_id: &str) -> BoxFuture<'static, StorageResult<()>> {
        self.write(SESSION_KEY, session_id)
    }
}

/// Process-local store, used when no storage directory is configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    entries: Arc<Mutex<HashMap<String, Vec<AnalyticsEvent>>>>,
    session: Arc<Mutex<Option<String>>>,
}

impl MemoryEventStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events currently stored under `key`.
    pub fn snapshot(&self, key: &str) -> Vec<AnalyticsEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

impl EventStore for MemoryEventStore {
    fn load(&self, key: &str) -> BoxFuture<'static, StorageResult<Vec<AnalyticsEvent>>> {
        let events = self.snapshot(key);
        Box::pin(async move { Ok(events) })
    }

    fn save(&self, key: &str, events: Vec<AnalyticsEvent>) -> BoxFuture<'static, StorageResult<()>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), events);
        Box::pin(async { Ok(()) })
    }

    fn clear(&self, key: &str) -> BoxFuture<'static, StorageResult<()>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Box::pin(async { Ok(()) })
    }

    fn load_session(&self) -> BoxFuture<'static, StorageResult<Option<String>>> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Box::pin(async move { Ok(session) })
    }

    fn save_session(&self, session_id: &str) -> BoxFuture<'static, StorageResult<()>> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::dto::analytics::{AssetType, DeviceClass, EventType};

    fn event(id: &str) -> AnalyticsEvent {
        AnalyticsEvent {
            id: id.into(),
            game_id: "game-1".into(),
            event_type: EventType::Impression,
            asset_type: AssetType::Image,
            asset_url: String::new(),
            session_id: "s".into(),
            device: DeviceClass::Desktop,
            variant: None,
            timestamp: "2024-01-05T10:00:00Z".into(),
            data: Map::new(),
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_and_clears() {
        let dir = std::env::temp_dir().join(format!("cardsync-store-{}", uuid::Uuid::new_v4()));
        let store = FileEventStore::new(&dir);

        assert!(store.load("pending").await.unwrap().is_empty());

        store
            .save("pending", vec![event("1"), event("2")])
            .await
            .unwrap();
        let loaded = store.load("pending").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, "2");

        store.clear("pending").await.unwrap();
        assert!(store.load("pending").await.unwrap().is_empty());
        store.clear("pending").await.unwrap();

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = std::env::temp_dir().join(format!("cardsync-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pending.json"), b"not json").unwrap();

        let store = FileEventStore::new(&dir);
        let err = store.load("pending").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { ref key, .. } if key == "pending"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn file_store_keeps_the_session_id() {
        let dir = std::env::temp_dir().join(format!("cardsync-store-{}", uuid::Uuid::new_v4()));
        let store = FileEventStore::new(&dir);
        assert_eq!(store.load_session().await.unwrap(), None);

        store.save_session("cardsync_1_abc").await.unwrap();
        let reopened = FileEventStore::new(&dir);
        assert_eq!(
            reopened.load_session().await.unwrap().as_deref(),
            Some("cardsync_1_abc")
        );
        assert!(dir.join(format!("{SESSION_KEY}.json")).exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn memory_store_keys_are_independent() {
        let store = MemoryEventStore::new();
        store.save("a", vec![event("1")]).await.unwrap();
        assert!(store.load("b").await.unwrap().is_empty());
        assert_eq!(store.snapshot("a").len(), 1);
    }
}
