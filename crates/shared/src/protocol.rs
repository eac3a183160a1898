use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Attachment, Message, MessageId, ThreadId, UserId};

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    Auth {
        username: String,
        secret: String,
    },
    SendMessage {
        client_id: MessageId,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
        timestamp: DateTime<Utc>,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    RequestHistory {
        thread_id: ThreadId,
    },
    UpdateProfilePicture {
        username: String,
        image_data: String,
    },
    ChangePassword {
        username: String,
        old_secret: String,
        new_secret: String,
    },
    MarkThreadRead {
        thread_id: ThreadId,
        reader: UserId,
    },
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Auth { .. } => "auth",
            ClientRequest::SendMessage { .. } => "send-message",
            ClientRequest::DeleteMessage { .. } => "delete-message",
            ClientRequest::RequestHistory { .. } => "request-history",
            ClientRequest::UpdateProfilePicture { .. } => "update-profile-picture",
            ClientRequest::ChangePassword { .. } => "change-password",
            ClientRequest::MarkThreadRead { .. } => "mark-thread-read",
        }
    }
}

// Requests carry secrets, so only the event name is printed.
impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientRequest").field(&self.name()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    AuthSuccess {
        user_id: UserId,
    },
    AuthFailed {},
    PresenceSnapshot {
        users: Vec<UserId>,
    },
    Message(Message),
    HistorySnapshot {
        thread_id: ThreadId,
        messages: Vec<Message>,
    },
    MessageDeleted {
        message_id: MessageId,
        deleted_by: UserId,
    },
    DeleteRejected {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    ProfilePictureUpdated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    PasswordChangeResult {
        success: bool,
    },
    /// Server hint that the client should serve reads from its local cache.
    UseLocalStorage {},
}

impl ServerEvent {
    pub const NAMES: [&'static str; 10] = [
        "auth-success",
        "auth-failed",
        "presence-snapshot",
        "message",
        "history-snapshot",
        "message-deleted",
        "delete-rejected",
        "profile-picture-updated",
        "password-change-result",
        "use-local-storage",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AuthSuccess { .. } => "auth-success",
            ServerEvent::AuthFailed {} => "auth-failed",
            ServerEvent::PresenceSnapshot { .. } => "presence-snapshot",
            ServerEvent::Message(_) => "message",
            ServerEvent::HistorySnapshot { .. } => "history-snapshot",
            ServerEvent::MessageDeleted { .. } => "message-deleted",
            ServerEvent::DeleteRejected { .. } => "delete-rejected",
            ServerEvent::ProfilePictureUpdated { .. } => "profile-picture-updated",
            ServerEvent::PasswordChangeResult { .. } => "password-change-result",
            ServerEvent::UseLocalStorage {} => "use-local-storage",
        }
    }
}
