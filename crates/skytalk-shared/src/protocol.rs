//! Realtime wire protocol.
//!
//! Every WebSocket text frame carries exactly one event encoded as
//! `{"event": "<name>", "data": {...}}`. Payload fields are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::types::{MessageId, MessageKind, Participant, UserId};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Events a client may emit on an authenticated connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    SendMessage(SendMessage),
    Typing(TypingTarget),
    StopTyping(TypingTarget),
    DeleteMessage(DeleteMessage),
}

/// Raw `send-message` payload. Ids are validated by the relay so that a bad
/// id surfaces as a readable `error` event rather than a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub receiver_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    pub receiver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub message_id: String,
    /// Sent by clients for compatibility; the participants are taken from
    /// the stored message instead.
    #[serde(default)]
    pub receiver_id: Option<String>,
}

impl ClientEvent {
    /// Decode one text frame. Anything that is not a known event with a
    /// well-formed payload is a validation error.
    pub fn decode(frame: &str) -> Result<Self, RelayError> {
        serde_json::from_str(frame).map_err(|e| RelayError::validation(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send-message",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop-typing",
            Self::DeleteMessage(_) => "delete-message",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    UserOnline(UserRef),
    UserOffline(UserRef),
    ReceiveMessage(MessagePayload),
    MessageSent(MessagePayload),
    UserTyping(TypingPayload),
    UserStopTyping(UserRef),
    MessageDeleted(MessageDeleted),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    pub deleted_by: Participant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

/// A persisted message as seen by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    /// Store-assigned sequence number; the ordering key within a conversation.
    pub seq: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: Option<String>,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
    pub is_read: bool,
    pub is_deleted: bool,
    pub timestamp: DateTime<Utc>,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn user_online(user_id: UserId) -> Self {
        Self::UserOnline(UserRef { user_id })
    }

    pub fn user_offline(user_id: UserId) -> Self {
        Self::UserOffline(UserRef { user_id })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UserOnline(_) => "user-online",
            Self::UserOffline(_) => "user-offline",
            Self::ReceiveMessage(_) => "receive-message",
            Self::MessageSent(_) => "message-sent",
            Self::UserTyping(_) => "user-typing",
            Self::UserStopTyping(_) => "user-stop-typing",
            Self::MessageDeleted(_) => "message-deleted",
            Self::Error(_) => "error",
        }
    }
}

impl From<RelayError> for ServerEvent {
    fn from(err: RelayError) -> Self {
        ServerEvent::error(err.client_message())
    }
}
