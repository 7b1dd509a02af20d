//! Presence Registry
//!
//! In-memory map of user id to the user's single active connection. A second
//! connection for the same user replaces the first; the replaced connection is
//! not closed here, it simply stops receiving routed events.
//!
//! Every connection owns an mpsc channel drained by its socket writer task, so
//! routing an event never blocks on a slow peer.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use skytalk_shared::constants::CONNECTION_BUFFER;
use skytalk_shared::protocol::ServerEvent;
use skytalk_shared::UserId;

use crate::auth::UserIdentity;

pub type ConnectionId = Uuid;

/// Sending side of one authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: UserIdentity,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its writer task drains.
    pub fn new(identity: UserIdentity) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        (
            Self {
                id: Uuid::new_v4(),
                identity,
                tx,
            },
            rx,
        )
    }

    pub fn user_id(&self) -> UserId {
        self.identity.id
    }

    /// Queue an event. Returns `false` if the connection is gone or its
    /// buffer is full; the event is dropped in that case.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    user = %self.identity.id,
                    conn = %self.id,
                    event = event.name(),
                    "Connection buffer full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(conn = %self.id, event = event.name(), "Connection closed, dropping event");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub handle: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
}

/// Thread-safe registry of online users.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<UserId, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` as the user's active connection, returning the entry it
    /// replaced, if any.
    pub fn register(&self, handle: ConnectionHandle) -> Option<PresenceEntry> {
        let user = handle.user_id();
        let entry = PresenceEntry {
            handle,
            connected_at: Utc::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user, entry)
    }

    /// Remove the user's entry, but only while it still belongs to
    /// `connection`. Returns whether an entry was removed.
    pub fn unregister(&self, user: UserId, connection: ConnectionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&user) {
            Some(entry) if entry.handle.id == connection => {
                entries.remove(&user);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, user: UserId) -> Option<ConnectionHandle> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .map(|entry| entry.handle.clone())
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&user)
    }

    /// Route an event to the user's active connection. Returns `false` if the
    /// user is offline or the event could not be queued.
    pub fn send_to(&self, user: UserId, event: ServerEvent) -> bool {
        match self.lookup(user) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Best-effort fan-out to every online user except `user`. Returns how
    /// many connections accepted the event.
    pub fn broadcast_except(&self, user: UserId, event: &ServerEvent) -> usize {
        let targets: Vec<ConnectionHandle> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| **id != user)
            .map(|(_, entry)| entry.handle.clone())
            .collect();

        targets
            .into_iter()
            .filter(|handle| handle.send(event.clone()))
            .count()
    }

    pub fn online_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> UserIdentity {
        UserIdentity {
            id: UserId::new(),
            username: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = PresenceRegistry::new();
        let alice = identity("alice");
        let (handle, mut rx) = ConnectionHandle::new(alice.clone());
        assert!(registry.register(handle).is_none());

        assert!(registry.send_to(alice.id, ServerEvent::error("ping")));
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::error("ping"));
    }

    #[test]
    fn test_send_to_offline_user() {
        let registry = PresenceRegistry::new();
        assert!(!registry.send_to(UserId::new(), ServerEvent::error("nobody")));
        assert!(registry.lookup(UserId::new()).is_none());
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let registry = PresenceRegistry::new();
        let alice = identity("alice");
        let (first, mut rx_first) = ConnectionHandle::new(alice.clone());
        let (second, mut rx_second) = ConnectionHandle::new(alice.clone());
        let first_id = first.id;

        registry.register(first);
        let replaced = registry.register(second).unwrap();
        assert_eq!(replaced.handle.id, first_id);
        assert_eq!(registry.online_count(), 1);

        registry.send_to(alice.id, ServerEvent::error("hello"));
        assert_eq!(rx_second.recv().await.unwrap(), ServerEvent::error("hello"));
        assert!(rx_first.try_recv().is_err());
    }

    #[test]
    fn test_stale_unregister_keeps_newer_entry() {
        let registry = PresenceRegistry::new();
        let alice = identity("alice");
        let (first, _rx1) = ConnectionHandle::new(alice.clone());
        let (second, _rx2) = ConnectionHandle::new(alice.clone());
        let (first_id, second_id) = (first.id, second.id);

        registry.register(first);
        registry.register(second);

        assert!(!registry.unregister(alice.id, first_id));
        assert!(registry.is_online(alice.id));

        assert!(registry.unregister(alice.id, second_id));
        assert!(!registry.is_online(alice.id));
        assert!(!registry.unregister(alice.id, second_id));
    }

    #[tokio::test]
    async fn test_broadcast_except() {
        let registry = PresenceRegistry::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let carol = identity("carol");
        let (a, mut rx_a) = ConnectionHandle::new(alice.clone());
        let (b, mut rx_b) = ConnectionHandle::new(bob);
        let (c, mut rx_c) = ConnectionHandle::new(carol);
        registry.register(a);
        registry.register(b);
        registry.register(c);

        let event = ServerEvent::user_online(alice.id);
        assert_eq!(registry.broadcast_except(alice.id, &event), 2);

        assert_eq!(rx_b.recv().await.unwrap(), event);
        assert_eq!(rx_c.recv().await.unwrap(), event);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_full_buffer_drops_event() {
        let (handle, _rx) = ConnectionHandle::new(identity("slow"));
        for _ in 0..CONNECTION_BUFFER {
            assert!(handle.send(ServerEvent::error("x")));
        }
        assert!(!handle.send(ServerEvent::error("overflow")));
    }

    #[test]
    fn test_closed_connection_drops_event() {
        let (handle, rx) = ConnectionHandle::new(identity("gone"));
        drop(rx);
        assert!(!handle.send(ServerEvent::error("x")));
    }
}
