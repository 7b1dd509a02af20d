//! The friendship edge list and pending friend requests.
//!
//! Each unordered pair is stored once with `user_a < user_b`, so the
//! relation is symmetric by construction. A friendship forms once both
//! users have asked for it.

use chrono::Utc;
use rusqlite::params;

use skytalk_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{FriendRequestStatus, User};
use crate::users::row_to_user;

fn ordered(a: UserId, b: UserId) -> (String, String) {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    (lo.to_string(), hi.to_string())
}

impl Database {
    /// Record a friendship. Idempotent; befriending oneself is rejected.
    pub fn add_friendship(&self, a: UserId, b: UserId) -> Result<()> {
        if a == b {
            return Err(StoreError::Invalid("a user cannot befriend themselves".into()));
        }
        let (lo, hi) = ordered(a, b);
        self.conn().execute(
            "INSERT OR IGNORE INTO friendships (user_a, user_b, created_at)
             VALUES (?1, ?2, ?3)",
            params![lo, hi, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_friendship(&self, a: UserId, b: UserId) -> Result<bool> {
        let (lo, hi) = ordered(a, b);
        let affected = self.conn().execute(
            "DELETE FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            params![lo, hi],
        )?;
        Ok(affected > 0)
    }

    pub fn are_friends(&self, a: UserId, b: UserId) -> Result<bool> {
        if a == b {
            return Ok(false);
        }
        let (lo, hi) = ordered(a, b);
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            params![lo, hi],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ask `from` to be friends with `to`. A pending request in the other
    /// direction is consumed and the friendship is created.
    pub fn request_friendship(&self, from: UserId, to: UserId) -> Result<FriendRequestStatus> {
        if from == to {
            return Err(StoreError::Invalid("a user cannot befriend themselves".into()));
        }
        if self.get_user(to)?.is_none() {
            return Err(StoreError::NotFound);
        }
        if self.are_friends(from, to)? {
            return Ok(FriendRequestStatus::AlreadyFriends);
        }

        let tx = self.conn().unchecked_transaction()?;
        let reciprocal = tx.execute(
            "DELETE FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2",
            params![to.to_string(), from.to_string()],
        )?;
        let status = if reciprocal > 0 {
            self.add_friendship(from, to)?;
            FriendRequestStatus::Accepted
        } else {
            tx.execute(
                "INSERT OR IGNORE INTO friend_requests (sender_id, receiver_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![from.to_string(), to.to_string(), Utc::now().to_rfc3339()],
            )?;
            FriendRequestStatus::Pending
        };
        tx.commit()?;

        tracing::debug!(from = %from, to = %to, ?status, "friend request");
        Ok(status)
    }

    /// Users waiting for `user` to answer their request, oldest first.
    pub fn pending_requests(&self, user: UserId) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.username, u.email, u.avatar, u.created_at
             FROM friend_requests r
             JOIN users u ON u.id = r.sender_id
             WHERE r.receiver_id = ?1
             ORDER BY r.created_at, u.username",
        )?;

        let rows = stmt.query_map(params![user.to_string()], row_to_user)?;

        let mut senders = Vec::new();
        for row in rows {
            senders.push(row?);
        }
        Ok(senders)
    }

    pub fn list_friends(&self, user: UserId) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.username, u.email, u.avatar, u.created_at
             FROM friendships f
             JOIN users u
               ON u.id = CASE WHEN f.user_a = ?1 THEN f.user_b ELSE f.user_a END
             WHERE f.user_a = ?1 OR f.user_b = ?1
             ORDER BY u.username",
        )?;

        let rows = stmt.query_map(params![user.to_string()], row_to_user)?;

        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }
}
