use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS friend_requests (
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    created_at  TEXT NOT NULL,                -- RFC-3339

    PRIMARY KEY (sender_id, receiver_id),
    CHECK (sender_id <> receiver_id),
    FOREIGN KEY (sender_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (receiver_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver
    ON friend_requests(receiver_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
