//! # Session Store
//!
//! Durable home of the single `BroadcastSession` record. The coordinator only
//! ever writes through `compare_and_swap`, so a writer holding a stale copy can
//! never clobber a newer record.

use super::model::BroadcastSession;
use crate::storage::{read_json, write_json_atomic};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current record, if one was ever written.
    async fn load(&self) -> Result<Option<BroadcastSession>>;

    /// Return the stored record, writing `default` first if there is none.
    async fn create_if_absent(&self, default: BroadcastSession) -> Result<BroadcastSession>;

    /// Replace the record only if its version is still `expected_version`.
    /// On success the stored copy has version `expected_version + 1`, which is
    /// returned. `Ok(None)` means someone else wrote first.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: BroadcastSession,
    ) -> Result<Option<BroadcastSession>>;
}

/// Volatile store used in tests and single-run tooling.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    record: Mutex<Option<BroadcastSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> Result<Option<BroadcastSession>> {
        Ok(self.record.lock().await.clone())
    }

    async fn create_if_absent(&self, default: BroadcastSession) -> Result<BroadcastSession> {
        let mut record = self.record.lock().await;
        Ok(record.get_or_insert(default).clone())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut next: BroadcastSession,
    ) -> Result<Option<BroadcastSession>> {
        let mut record = self.record.lock().await;
        let current_version = record.as_ref().map(|r| r.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(None);
        }
        next.version = expected_version + 1;
        *record = Some(next.clone());
        Ok(Some(next))
    }
}

/// Store backed by a JSON file; the rehydration source after a restart.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    // Serialises read-modify-write cycles on the file.
    guard: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<BroadcastSession>> {
        let _guard = self.guard.lock().await;
        read_json(&self.path).await
    }

    async fn create_if_absent(&self, default: BroadcastSession) -> Result<BroadcastSession> {
        let _guard = self.guard.lock().await;
        if let Some(existing) = read_json::<BroadcastSession>(&self.path).await? {
            return Ok(existing);
        }
        write_json_atomic(&self.path, &default).await?;
        Ok(default)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut next: BroadcastSession,
    ) -> Result<Option<BroadcastSession>> {
        let _guard = self.guard.lock().await;
        let current_version = read_json::<BroadcastSession>(&self.path)
            .await?
            .map(|r| r.version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Ok(None);
        }
        next.version = expected_version + 1;
        write_json_atomic(&self.path, &next).await?;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::BroadcastStatus;
    use chrono::Utc;

    async fn exercise(store: &dyn SessionStore) {
        assert!(store.load().await.unwrap().is_none());

        let created = store
            .create_if_absent(BroadcastSession::offline(Utc::now()))
            .await
            .unwrap();
        assert_eq!(created.version, 0);

        let mut next = created.clone();
        next.title = Some("first".to_string());
        let written = store.compare_and_swap(0, next).await.unwrap().unwrap();
        assert_eq!(written.version, 1);

        // Stale writer loses.
        let mut stale = created.clone();
        stale.title = Some("stale".to_string());
        assert!(store.compare_and_swap(0, stale).await.unwrap().is_none());

        // create_if_absent never overwrites.
        let again = store
            .create_if_absent(BroadcastSession::offline(Utc::now()))
            .await
            .unwrap();
        assert_eq!(again.title.as_deref(), Some("first"));
        assert_eq!(again.status, BroadcastStatus::Offline);
    }

    #[tokio::test]
    async fn test_in_memory_store_conditional_update() {
        exercise(&InMemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_conditional_update_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        exercise(&FileSessionStore::new(&path)).await;

        let reopened = FileSessionStore::new(&path);
        let record = reopened.load().await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.title.as_deref(), Some("first"));
    }
}
