use anyhow::{Context, Result};
use chrono::Utc;
use shared::domain::{Credentials, Message, ThreadId, UserId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, warn};

/// Durable key/value entries of the chat client. Every entry is keyed by the
/// local username (`owner`) so several identities can share one device.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredThread {
    pub thread_id: ThreadId,
    pub messages: Vec<Message>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database gets a private database.
        let pool = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(connect_options)
        .await
        .with_context(|| format!("failed to open offline cache at '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (owner, secret, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(owner) DO UPDATE SET secret=excluded.secret, updated_at=excluded.updated_at",
        )
        .bind(&credentials.username)
        .bind(&credentials.secret)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save credentials")?;
        Ok(())
    }

    pub async fn load_credentials(&self, owner: &str) -> Result<Option<Credentials>> {
        let row = sqlx::query("SELECT owner, secret FROM credentials WHERE owner = ?")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Credentials::new(r.get::<String, _>(0), r.get::<String, _>(1))))
    }

    /// Credentials of the identity that authenticated most recently.
    pub async fn load_last_credentials(&self) -> Result<Option<Credentials>> {
        let row = sqlx::query(
            "SELECT owner, secret FROM credentials ORDER BY updated_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Credentials::new(r.get::<String, _>(0), r.get::<String, _>(1))))
    }

    pub async fn clear_credentials(&self, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await
            .context("failed to clear credentials")?;
        Ok(())
    }

    /// Replaces the stored snapshot of one thread.
    pub async fn save_thread(
        &self,
        owner: &str,
        thread_id: &ThreadId,
        messages: &[Message],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM thread_messages WHERE owner = ? AND thread_id = ?")
            .bind(owner)
            .bind(thread_id.as_str())
            .execute(&mut *tx)
            .await?;
        for (position, message) in messages.iter().enumerate() {
            let payload = serde_json::to_string(message)
                .with_context(|| format!("failed to encode message {}", message.id))?;
            sqlx::query(
                "INSERT INTO thread_messages (owner, thread_id, position, message_id, payload)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(owner)
            .bind(thread_id.as_str())
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(message.id.as_str())
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit()
            .await
            .with_context(|| format!("failed to save thread '{thread_id}'"))?;
        debug!(owner, thread_id = %thread_id, count = messages.len(), "thread snapshot saved");
        Ok(())
    }

    /// Replaces every stored thread of `owner` in one transaction.
    pub async fn save_threads(&self, owner: &str, threads: &[StoredThread]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM thread_messages WHERE owner = ?")
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        for thread in threads {
            for (position, message) in thread.messages.iter().enumerate() {
                let payload = serde_json::to_string(message)
                    .with_context(|| format!("failed to encode message {}", message.id))?;
                sqlx::query(
                    "INSERT INTO thread_messages (owner, thread_id, position, message_id, payload)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(owner)
                .bind(thread.thread_id.as_str())
                .bind(i64::try_from(position).unwrap_or(i64::MAX))
                .bind(message.id.as_str())
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await.context("failed to save thread snapshot")?;
        Ok(())
    }

    pub async fn load_threads(&self, owner: &str) -> Result<Vec<StoredThread>> {
        let rows = sqlx::query(
            "SELECT thread_id, payload FROM thread_messages
             WHERE owner = ?
             ORDER BY thread_id ASC, position ASC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        let mut threads: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for row in rows {
            let thread_id = row.get::<String, _>(0);
            let payload = row.get::<String, _>(1);
            match serde_json::from_str::<Message>(&payload) {
                Ok(message) => threads.entry(thread_id).or_default().push(message),
                Err(err) => {
                    warn!(owner, %thread_id, error = %err, "skipping undecodable cached message");
                }
            }
        }

        Ok(threads
            .into_iter()
            .map(|(thread_id, messages)| StoredThread {
                thread_id: ThreadId(thread_id),
                messages,
            })
            .collect())
    }

    pub async fn save_profile_picture(&self, owner: &str, image_data: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO profile_pictures (owner, image_data, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(owner) DO UPDATE SET image_data=excluded.image_data, updated_at=excluded.updated_at",
        )
        .bind(owner)
        .bind(image_data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save profile picture")?;
        Ok(())
    }

    pub async fn load_profile_picture(&self, owner: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT image_data FROM profile_pictures WHERE owner = ?")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Returns `true` when the peer was not known before.
    pub async fn remember_peer(&self, owner: &str, peer: &UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO known_peers (owner, peer, added_at) VALUES (?, ?, ?)
             ON CONFLICT(owner, peer) DO NOTHING",
        )
        .bind(owner)
        .bind(peer.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to record private-chat peer")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_known_peers(&self, owner: &str) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT peer FROM known_peers WHERE owner = ? ORDER BY peer ASC")
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<String, _>(0)))
            .collect())
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
