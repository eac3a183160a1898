use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const BROADCAST_THREAD: &str = "broadcast";
pub const PRIVATE_THREAD_SEPARATOR: char = '_';
const PROVISIONAL_ID_PREFIX: &str = "local-";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ThreadId);

impl MessageId {
    /// Client-assigned id used until the server acknowledges the message.
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_ID_PREFIX)
    }
}

impl ThreadId {
    pub fn broadcast() -> Self {
        Self(BROADCAST_THREAD.to_string())
    }

    /// Order-independent key for the conversation between `a` and `b`.
    ///
    /// The key is only unambiguous for ids without
    /// [`PRIVATE_THREAD_SEPARATOR`]: `("a_b", "c")` and `("a", "b_c")` both
    /// map to `a_b_c`. Logins with such names are refused client side.
    pub fn private(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{first}{PRIVATE_THREAD_SEPARATOR}{second}"))
    }

    pub fn route(sender: &UserId, receiver: Option<&UserId>) -> Self {
        match receiver {
            Some(receiver) => Self::private(sender, receiver),
            None => Self::broadcast(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_THREAD
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(alias = "type")]
    pub mime_type: String,
    #[serde(alias = "data")]
    pub encoded_data: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(alias = "username")]
    pub sender: UserId,
    #[serde(
        default,
        deserialize_with = "non_empty_user",
        skip_serializing_if = "Option::is_none"
    )]
    pub receiver: Option<UserId>,
    #[serde(default, alias = "message")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deleted_by: BTreeSet<UserId>,
    /// Provisional id echoed back by servers that support exact reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<MessageId>,
}

impl Message {
    pub fn thread_id(&self) -> ThreadId {
        ThreadId::route(&self.sender, self.receiver.as_ref())
    }

    /// Private peer of `local_user` in this message, if it is a private message
    /// that involves them.
    pub fn peer_of(&self, local_user: &UserId) -> Option<&UserId> {
        let receiver = self.receiver.as_ref()?;
        if &self.sender == local_user {
            Some(receiver)
        } else if receiver == local_user {
            Some(&self.sender)
        } else {
            None
        }
    }
}

fn non_empty_user<'de, D>(deserializer: D) -> Result<Option<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(UserId))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_thread_id_is_order_independent() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        assert_eq!(ThreadId::private(&alice, &bob), ThreadId::private(&bob, &alice));
        assert_eq!(ThreadId::private(&bob, &alice).as_str(), "alice_bob");
    }

    #[test]
    fn message_without_receiver_routes_to_broadcast() {
        let raw = r#"{"id":"m1","username":"alice","message":"hi","receiver":null,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let message: Message = serde_json::from_str(raw).expect("legacy message");
        assert_eq!(message.sender, UserId::from("alice"));
        assert_eq!(message.body, "hi");
        assert_eq!(message.receiver, None);
        assert!(message.thread_id().is_broadcast());
    }

    #[test]
    fn empty_receiver_is_normalized_to_none() {
        let raw = r#"{"id":"m2","sender":"bob","receiver":"  ","body":"x","timestamp":"2024-01-01T00:00:00Z"}"#;
        let message: Message = serde_json::from_str(raw).expect("message");
        assert_eq!(message.receiver, None);
    }

    #[test]
    fn private_message_routes_to_sorted_pair() {
        let raw = r#"{"id":"m3","sender":"bob","receiver":"alice","body":"yo","timestamp":"2024-01-01T00:00:00Z"}"#;
        let message: Message = serde_json::from_str(raw).expect("message");
        assert_eq!(message.thread_id(), ThreadId::from("alice_bob"));
        assert_eq!(message.peer_of(&UserId::from("alice")), Some(&UserId::from("bob")));
        assert_eq!(message.peer_of(&UserId::from("carol")), None);
    }

    #[test]
    fn credentials_debug_redacts_secret() {
        let rendered = format!("{:?}", Credentials::new("alice", "hunter2"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn provisional_ids_are_unique_and_marked() {
        let first = MessageId::provisional();
        let second = MessageId::provisional();
        assert_ne!(first, second);
        assert!(first.is_provisional());
        assert!(!MessageId::from("m1").is_provisional());
    }
}
