use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension};

use skytalk_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{parse_ts, parse_uuid};
use crate::models::User;

impl Database {
    /// Fails with [`StoreError::Conflict`] if the username is taken.
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let inserted = self.conn().execute(
            "INSERT INTO users (id, username, email, avatar, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                user.avatar,
                user.created_at.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Conflict(format!(
                    "username '{}' is already taken",
                    user.username
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, username, email, avatar, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }
}

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    user_at(row, 0)
}

/// Decode the five user columns starting at column `base`.
pub(crate) fn user_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<User> {
    let id: String = row.get(base)?;
    let created_at: String = row.get(base + 4)?;
    let created_at: DateTime<Utc> = parse_ts(base + 4, &created_at)?;

    Ok(User {
        id: UserId(parse_uuid(base, &id)?),
        username: row.get(base + 1)?,
        email: row.get(base + 2)?,
        avatar: row.get(base + 3)?,
        created_at,
    })
}
