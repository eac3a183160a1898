//! Client-side session and message synchronization engine for the chat
//! service: one socket connection, credential handling, presence, threaded
//! message history with optimistic updates and an offline cache.

use std::sync::Arc;

use anyhow::Result;

pub mod attachment;
pub mod auth;
pub mod directory;
pub mod offline_cache;
pub mod presence;
pub mod session;
pub mod store;
pub mod transport;

pub use attachment::{decode_attachment, encode_attachment, AttachmentLimits};
pub use directory::{fetch_user_directory, DirectoryEntry};
pub use offline_cache::{CachedSnapshot, OfflineCache};
pub use session::{Session, SessionController, SessionOptions, SessionStatus, SessionUpdate};
pub use shared::{
    domain::{Attachment, Message, MessageId, ThreadId, UserId},
    error::{ErrorKind, SessionError},
};
pub use transport::{ConnectionState, ReconnectPolicy, TransportConnection};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub database_url: String,
    pub reconnect: ReconnectPolicy,
    pub session: SessionOptions,
}

/// Wires a websocket transport and the on-disk cache into a controller.
/// Nothing connects until [`SessionController::start`] or
/// [`SessionController::login`] is called.
pub async fn open_session(config: &ClientConfig) -> Result<Arc<SessionController>> {
    let transport = TransportConnection::websocket(&config.server_url, config.reconnect.clone())?;
    let cache = OfflineCache::open(&config.database_url).await?;
    Ok(SessionController::new(
        Arc::new(transport),
        cache,
        config.session.clone(),
    ))
}
