//! Async seams between the realtime core and durable state.
//!
//! The relay and session layers only see these traits. `SqliteStore`
//! implements all of them on top of `skytalk_store::Database`, moving every
//! call onto a blocking thread.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use skytalk_shared::{MessageId, UserId};
use skytalk_store::{
    ConversationSummary, Database, FriendRequestStatus, Message, NewMessage, StoreError, User,
};

use crate::auth::UserIdentity;

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Hard delete. Returns `false` if the message was already gone.
    async fn delete(&self, id: MessageId) -> Result<bool, StoreError>;

    /// Latest `limit` messages between `reader` and `peer` in ascending
    /// order, then mark `peer`'s messages to `reader` as read.
    async fn read_conversation(
        &self,
        reader: UserId,
        peer: UserId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError>;
}

/// The friendship relation.
#[async_trait]
pub trait FriendshipOracle: Send + Sync {
    /// Symmetric. Always `false` for a user and themselves.
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError>;

    async fn friends_of(&self, user: UserId) -> Result<Vec<User>, StoreError>;

    async fn request_friendship(
        &self,
        from: UserId,
        to: UserId,
    ) -> Result<FriendRequestStatus, StoreError>;

    async fn pending_requests(&self, user: UserId) -> Result<Vec<User>, StoreError>;

    async fn remove_friendship(&self, a: UserId, b: UserId) -> Result<bool, StoreError>;
}

/// Resolves credential subjects to accounts.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: UserId) -> Result<Option<UserIdentity>, StoreError>;

    /// Create an account. Fails with `StoreError::Conflict` if the username
    /// is taken.
    async fn register(&self, username: String) -> Result<UserIdentity, StoreError>;
}

/// Shared SQLite-backed implementation of every store seam.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Database::open_at(path).map(Self::new)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Database::open_in_memory().map(Self::new)
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| StoreError::Io(io::Error::other("database lock poisoned")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e.to_string())))?
    }

    pub async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.with_db(move |db| db.insert_user(&user)).await
    }

    pub async fn add_friendship(&self, a: UserId, b: UserId) -> Result<(), StoreError> {
        self.with_db(move |db| db.add_friendship(a, b)).await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.with_db(move |db| db.insert_message(&message)).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        self.with_db(move |db| db.get_message(id)).await
    }

    async fn delete(&self, id: MessageId) -> Result<bool, StoreError> {
        self.with_db(move |db| db.delete_message(id)).await
    }

    async fn read_conversation(
        &self,
        reader: UserId,
        peer: UserId,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_db(move |db| db.read_conversation(reader, peer, limit))
            .await
    }

    async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError> {
        self.with_db(move |db| db.conversation_summaries(user)).await
    }
}

#[async_trait]
impl FriendshipOracle for SqliteStore {
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
        self.with_db(move |db| db.are_friends(a, b)).await
    }

    async fn friends_of(&self, user: UserId) -> Result<Vec<User>, StoreError> {
        self.with_db(move |db| db.list_friends(user)).await
    }

    async fn request_friendship(
        &self,
        from: UserId,
        to: UserId,
    ) -> Result<FriendRequestStatus, StoreError> {
        self.with_db(move |db| db.request_friendship(from, to)).await
    }

    async fn pending_requests(&self, user: UserId) -> Result<Vec<User>, StoreError> {
        self.with_db(move |db| db.pending_requests(user)).await
    }

    async fn remove_friendship(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
        self.with_db(move |db| db.remove_friendship(a, b)).await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn find_user(&self, id: UserId) -> Result<Option<UserIdentity>, StoreError> {
        let user = self.with_db(move |db| db.get_user(id)).await?;
        Ok(user.map(|u| UserIdentity {
            id: u.id,
            username: u.username,
        }))
    }

    async fn register(&self, username: String) -> Result<UserIdentity, StoreError> {
        let user = User::new(username);
        let identity = UserIdentity {
            id: user.id,
            username: user.username.clone(),
        };
        self.with_db(move |db| db.insert_user(&user)).await?;
        Ok(identity)
    }
}
