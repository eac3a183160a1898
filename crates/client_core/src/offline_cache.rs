use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{Credentials, Message, ThreadId, UserId};
use storage::{Storage, StoredThread};
use tracing::debug;

use crate::auth::CredentialStore;

/// Durable copy of what the client needs to keep working without a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedSnapshot {
    pub credentials: Option<Credentials>,
    pub threads: BTreeMap<ThreadId, Vec<Message>>,
}

/// Thin, owner-keyed view over [`Storage`].
#[derive(Clone)]
pub struct OfflineCache {
    storage: Storage,
}

impl OfflineCache {
    pub async fn open(database_url: &str) -> Result<Self> {
        Ok(Self::from_storage(Storage::new(database_url).await?))
    }

    pub fn from_storage(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Replaces every cached thread of `owner`. Credentials are written only
    /// when the snapshot carries them.
    pub async fn persist(&self, owner: &str, snapshot: &CachedSnapshot) -> Result<()> {
        if let Some(credentials) = &snapshot.credentials {
            self.storage.save_credentials(credentials).await?;
        }
        let threads: Vec<StoredThread> = snapshot
            .threads
            .iter()
            .map(|(thread_id, messages)| StoredThread {
                thread_id: thread_id.clone(),
                messages: messages.clone(),
            })
            .collect();
        self.storage.save_threads(owner, &threads).await?;
        debug!(owner, threads = threads.len(), "offline snapshot persisted");
        Ok(())
    }

    pub async fn persist_thread(
        &self,
        owner: &str,
        thread_id: &ThreadId,
        messages: &[Message],
    ) -> Result<()> {
        self.storage.save_thread(owner, thread_id, messages).await
    }

    pub async fn load(&self, owner: &str) -> Result<CachedSnapshot> {
        let credentials = self.storage.load_credentials(owner).await?;
        let threads = self
            .storage
            .load_threads(owner)
            .await?
            .into_iter()
            .map(|thread| (thread.thread_id, thread.messages))
            .collect();
        Ok(CachedSnapshot {
            credentials,
            threads,
        })
    }

    pub async fn save_profile_picture(&self, owner: &str, image_data: &str) -> Result<()> {
        self.storage.save_profile_picture(owner, image_data).await
    }

    pub async fn load_profile_picture(&self, owner: &str) -> Result<Option<String>> {
        self.storage.load_profile_picture(owner).await
    }

    pub async fn remember_peer(&self, owner: &str, peer: &UserId) -> Result<bool> {
        self.storage.remember_peer(owner, peer).await
    }

    pub async fn known_peers(&self, owner: &str) -> Result<Vec<UserId>> {
        self.storage.list_known_peers(owner).await
    }
}

#[async_trait]
impl CredentialStore for OfflineCache {
    async fn load_last_credentials(&self) -> Result<Option<Credentials>> {
        self.storage.load_last_credentials().await
    }

    async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        self.storage.save_credentials(credentials).await
    }

    async fn clear_credentials(&self, username: &str) -> Result<()> {
        self.storage.clear_credentials(username).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::domain::MessageId;

    fn message(id: &str, sender: &str, body: &str) -> Message {
        Message {
            id: MessageId::from(id),
            sender: UserId::from(sender),
            receiver: None,
            body: body.to_string(),
            attachment: None,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
            deleted_by: Default::default(),
            client_id: None,
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_per_owner() {
        let cache = OfflineCache::open("sqlite::memory:").await.expect("cache");
        let mut threads = BTreeMap::new();
        threads.insert(
            ThreadId::broadcast(),
            vec![message("m1", "alice", "hi"), message("m2", "bob", "yo")],
        );
        let snapshot = CachedSnapshot {
            credentials: Some(Credentials::new("alice", "pw")),
            threads,
        };

        cache.persist("alice", &snapshot).await.expect("persist");

        assert_eq!(cache.load("alice").await.expect("load"), snapshot);
        assert_eq!(cache.load("bob").await.expect("load"), CachedSnapshot::default());
    }

    #[tokio::test]
    async fn persist_without_credentials_keeps_stored_ones() {
        let cache = OfflineCache::open("sqlite::memory:").await.expect("cache");
        cache
            .save_credentials(&Credentials::new("alice", "pw"))
            .await
            .expect("save");

        cache
            .persist("alice", &CachedSnapshot::default())
            .await
            .expect("persist");

        let loaded = cache.load("alice").await.expect("load");
        assert_eq!(loaded.credentials, Some(Credentials::new("alice", "pw")));
        assert!(loaded.threads.is_empty());
    }
}
