//! Message Relay Protocol
//!
//! Friendship-gated message delivery, typing forwarding and deletion. Every
//! operation is driven by one event on an authenticated connection and
//! reports failures as a [`RelayError`], which the session turns into an
//! `error` event for that connection only.

use std::sync::Arc;

use tracing::{debug, info, warn};

use skytalk_shared::constants::MAX_MESSAGE_CHARS;
use skytalk_shared::protocol::{
    MessageDeleted, MessagePayload, SendMessage, ServerEvent, TypingPayload, UserRef,
};
use skytalk_shared::{MessageId, MessageKind, RelayError, UserId};
use skytalk_store::messages::file_name_from_url;
use skytalk_store::{Attachment, NewMessage, StoreError};

use crate::auth::UserIdentity;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::store::{FriendshipOracle, MessageStore};

/// Result of a successful `send-message`.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: MessagePayload,
    /// Whether the receiver had a live connection that accepted the event.
    pub delivered: bool,
}

#[derive(Clone)]
pub struct Relay {
    presence: Arc<PresenceRegistry>,
    messages: Arc<dyn MessageStore>,
    friends: Arc<dyn FriendshipOracle>,
}

impl Relay {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        messages: Arc<dyn MessageStore>,
        friends: Arc<dyn FriendshipOracle>,
    ) -> Self {
        Self {
            presence,
            messages,
            friends,
        }
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Validate, check friendship, persist, deliver live if the receiver is
    /// online, then acknowledge the sender whatever the receiver's presence.
    pub async fn send_message(
        &self,
        origin: &ConnectionHandle,
        payload: SendMessage,
    ) -> Result<SendOutcome, RelayError> {
        let sender = origin.user_id();
        let new = validate_send(sender, payload)?;
        let receiver = new.receiver_id;

        if !self.ensure_friends(sender, receiver).await? {
            debug!(sender = %sender, receiver = %receiver, "Rejected message between non-friends");
            return Err(RelayError::NotFriends);
        }

        let stored = self.messages.insert(new).await.map_err(store_error)?;
        let message = MessagePayload::from(&stored);

        let delivered = self
            .presence
            .send_to(receiver, ServerEvent::ReceiveMessage(message.clone()));
        origin.send(ServerEvent::MessageSent(message.clone()));

        info!(
            id = %message.id,
            seq = message.seq,
            sender = %sender,
            receiver = %receiver,
            kind = message.message_type.as_str(),
            delivered,
            "Message relayed"
        );

        Ok(SendOutcome { message, delivered })
    }

    async fn ensure_friends(&self, a: UserId, b: UserId) -> Result<bool, RelayError> {
        self.friends.are_friends(a, b).await.map_err(store_error)
    }

    /// Forward `typing` or `stop-typing` to the receiver if online. Returns
    /// the parsed receiver id.
    pub fn typing(
        &self,
        sender: &UserIdentity,
        receiver_id: &str,
        active: bool,
    ) -> Result<UserId, RelayError> {
        let receiver = parse_user_id(receiver_id)?;
        if receiver == sender.id {
            return Err(RelayError::validation("cannot send typing events to yourself"));
        }
        self.forward_typing(sender, receiver, active);
        Ok(receiver)
    }

    /// Best effort; dropped silently when the receiver is offline.
    pub fn forward_typing(&self, sender: &UserIdentity, receiver: UserId, active: bool) -> bool {
        let event = if active {
            ServerEvent::UserTyping(TypingPayload {
                user_id: sender.id,
                username: sender.username.clone(),
            })
        } else {
            ServerEvent::UserStopTyping(UserRef { user_id: sender.id })
        };
        self.presence.send_to(receiver, event)
    }

    /// Permanently delete a message on behalf of one of its participants and
    /// notify both participants' live connections. `origin` always receives
    /// the notification, even when it is no longer the registered connection.
    pub async fn delete_message(
        &self,
        actor: UserId,
        message_id: &str,
        origin: Option<&ConnectionHandle>,
    ) -> Result<MessageDeleted, RelayError> {
        let id: MessageId = message_id
            .parse()
            .map_err(|_| RelayError::validation("messageId is not a valid id"))?;

        let message = self
            .messages
            .get(id)
            .await
            .map_err(store_error)?
            .ok_or(RelayError::NotFound("Message"))?;

        let Some(deleted_by) = message.participant(actor) else {
            warn!(actor = %actor, message = %id, "Delete attempted by non-participant");
            return Err(RelayError::Forbidden);
        };

        if !self.messages.delete(id).await.map_err(store_error)? {
            return Err(RelayError::NotFound("Message"));
        }

        let notice = MessageDeleted {
            message_id: id,
            deleted_by,
        };
        let event = ServerEvent::MessageDeleted(notice.clone());

        if let Some(origin) = origin {
            origin.send(event.clone());
        }
        for participant in [message.sender_id, message.receiver_id] {
            if let Some(handle) = self.presence.lookup(participant) {
                if origin.map_or(true, |o| o.id != handle.id) {
                    handle.send(event.clone());
                }
            }
        }

        info!(message = %id, actor = %actor, deleted_by = ?deleted_by, "Message deleted");
        Ok(notice)
    }
}

fn store_error(err: StoreError) -> RelayError {
    match err {
        StoreError::Invalid(detail) => RelayError::Validation(detail),
        StoreError::NotFound => RelayError::NotFound("Record"),
        other => {
            warn!(error = %other, "Store operation failed");
            RelayError::StoreUnavailable(other.to_string())
        }
    }
}

fn parse_user_id(raw: &str) -> Result<UserId, RelayError> {
    raw.parse()
        .map_err(|_| RelayError::validation("receiverId is not a valid id"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Turn a raw `send-message` payload into a storable message.
fn validate_send(sender: UserId, payload: SendMessage) -> Result<NewMessage, RelayError> {
    let receiver = parse_user_id(&payload.receiver_id)?;
    if receiver == sender {
        return Err(RelayError::validation("cannot message yourself"));
    }

    let kind = match payload.message_type.as_deref().map(str::trim) {
        None | Some("") => MessageKind::Text,
        Some(name) => MessageKind::from_name(name)
            .ok_or_else(|| RelayError::validation(format!("unknown messageType '{name}'")))?,
    };

    let body = non_blank(payload.message);
    if let Some(body) = &body {
        if body.chars().count() > MAX_MESSAGE_CHARS {
            return Err(RelayError::validation(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
    }

    let file_url = non_blank(payload.file_url);
    let attachment = match (kind, file_url) {
        (MessageKind::Text, None) => {
            if body.is_none() {
                return Err(RelayError::validation("text messages need a body"));
            }
            None
        }
        (MessageKind::Text, Some(_)) => {
            return Err(RelayError::validation("text messages cannot carry a file"));
        }
        (_, None) => {
            return Err(RelayError::validation(format!(
                "{} messages need a fileUrl",
                kind.as_str()
            )));
        }
        (_, Some(url)) => {
            if let Some(size) = payload.file_size {
                if i64::try_from(size).is_err() {
                    return Err(RelayError::validation(format!("fileSize {size} is out of range")));
                }
            }
            Some(Attachment {
                name: non_blank(payload.file_name).unwrap_or_else(|| file_name_from_url(&url)),
                url,
                size: payload.file_size,
                mime_type: non_blank(payload.file_type),
            })
        }
    };

    Ok(NewMessage {
        sender_id: sender,
        receiver_id: receiver,
        body,
        kind,
        attachment,
    })
}
