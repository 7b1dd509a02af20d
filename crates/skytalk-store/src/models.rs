//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the HTTP
//! layer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use skytalk_shared::protocol::MessagePayload;
use skytalk_shared::{MessageId, MessageKind, Participant, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// An account known to the server. Owned by the account service; the
/// realtime core only reads it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            username: username.into(),
            email: None,
            avatar: None,
            created_at: Utc::now(),
        }
    }
}

/// Result of asking another user to be friends.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FriendRequestStatus {
    /// Waiting for the other user to ask back.
    Pending,
    /// The other user had already asked; the friendship now exists.
    Accepted,
    AlreadyFriends,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Blob-store reference carried by image and file messages.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

/// A single direct message between two users.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Monotonic, store-assigned. Orders messages and breaks timestamp ties.
    pub seq: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: Option<String>,
    pub kind: MessageKind,
    /// Present iff `kind` is not text.
    pub attachment: Option<Attachment>,
    pub is_read: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Which side of the message `user` is on, if any.
    pub fn participant(&self, user: UserId) -> Option<Participant> {
        if user == self.sender_id {
            Some(Participant::Sender)
        } else if user == self.receiver_id {
            Some(Participant::Receiver)
        } else {
            None
        }
    }

    /// The other participant, from `user`'s point of view.
    pub fn peer_of(&self, user: UserId) -> UserId {
        if user == self.sender_id {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// One-line rendering used in conversation lists.
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => self.body.clone().unwrap_or_default(),
            MessageKind::Image => "📷 Image".to_string(),
            MessageKind::File => {
                let name = self
                    .attachment
                    .as_ref()
                    .map(|a| a.name.as_str())
                    .unwrap_or("File");
                format!("📎 {name}")
            }
        }
    }
}

/// A message as submitted for persistence. The store assigns id, sequence
/// number and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: Option<String>,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

impl NewMessage {
    pub fn text(sender_id: UserId, receiver_id: UserId, body: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            body: Some(body.into()),
            kind: MessageKind::Text,
            attachment: None,
        }
    }
}

impl From<&Message> for MessagePayload {
    fn from(m: &Message) -> Self {
        let attachment = m.attachment.as_ref();
        Self {
            id: m.id,
            seq: m.seq,
            sender_id: m.sender_id,
            receiver_id: m.receiver_id,
            message: m.body.clone(),
            message_type: m.kind,
            file_url: attachment.map(|a| a.url.clone()),
            file_name: attachment.map(|a| a.name.clone()),
            file_size: attachment.and_then(|a| a.size),
            file_type: attachment.and_then(|a| a.mime_type.clone()),
            is_read: m.is_read,
            is_deleted: m.is_deleted,
            timestamp: m.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation summary (derived, never stored)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRef {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

impl From<&User> for FriendRef {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            avatar: u.avatar.clone(),
        }
    }
}

/// Latest activity with one conversation partner.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub friend: FriendRef,
    pub last_message: String,
    pub last_message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    /// Messages from `friend` the requester has not read yet.
    pub unread_count: u32,
}
