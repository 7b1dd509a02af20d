//! v001 -- Initial schema creation.
//!
//! Creates `users`, `friendships` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (written by the account service, read here)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID
    username   TEXT NOT NULL UNIQUE,
    email      TEXT,
    avatar     TEXT,
    created_at TEXT NOT NULL                  -- RFC-3339
);

-- ----------------------------------------------------------------
-- Friendships: one row per unordered pair, user_a < user_b
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    user_a     TEXT NOT NULL,
    user_b     TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_a, user_b),
    CHECK (user_a < user_b),
    FOREIGN KEY (user_a) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (user_b) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_friendships_user_b ON friendships(user_b);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,  -- ordering key
    id          TEXT NOT NULL UNIQUE,               -- UUID v4
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    body        TEXT,
    kind        TEXT NOT NULL DEFAULT 'text'
                CHECK (kind IN ('text', 'image', 'file')),
    file_url    TEXT,
    file_name   TEXT,
    file_size   INTEGER,
    file_type   TEXT,
    is_read     INTEGER NOT NULL DEFAULT 0,         -- boolean 0/1
    is_deleted  INTEGER NOT NULL DEFAULT 0,         -- boolean 0/1
    created_at  TEXT NOT NULL,

    FOREIGN KEY (sender_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (receiver_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_seq
    ON messages(sender_id, receiver_id, seq DESC);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(receiver_id, is_read);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
