use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use skytalk_shared::{MessageId, MessageKind, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Attachment, ConversationSummary, FriendRef, Message, NewMessage};
use crate::users::user_at;

const MESSAGE_COLUMNS: &str = "seq, id, sender_id, receiver_id, body, kind, file_url, file_name, \
     file_size, file_type, is_read, is_deleted, created_at";

/// Number of columns in [`MESSAGE_COLUMNS`].
const MESSAGE_WIDTH: usize = 13;

impl Database {
    /// Append a message. The store assigns id, sequence number and timestamp;
    /// new messages start unread and not deleted.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        if new.kind.has_attachment() != new.attachment.is_some() {
            return Err(StoreError::Invalid(format!(
                "{} message with{} attachment",
                new.kind.as_str(),
                if new.attachment.is_some() { "" } else { "out" }
            )));
        }

        let id = MessageId::new();
        let created_at = Utc::now();
        let attachment = new.attachment.as_ref();
        let file_size = attachment
            .and_then(|a| a.size)
            .map(|size| {
                i64::try_from(size)
                    .map_err(|_| StoreError::Invalid(format!("file size {size} out of range")))
            })
            .transpose()?;

        self.conn().execute(
            "INSERT INTO messages (id, sender_id, receiver_id, body, kind, file_url, file_name,
                                   file_size, file_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id.to_string(),
                new.sender_id.to_string(),
                new.receiver_id.to_string(),
                new.body,
                new.kind.as_str(),
                attachment.map(|a| a.url.as_str()),
                attachment.map(|a| a.name.as_str()),
                file_size,
                attachment.and_then(|a| a.mime_type.as_deref()),
                created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        let seq = self.conn().last_insert_rowid();

        Ok(Message {
            id,
            seq,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            body: new.body.clone(),
            kind: new.kind,
            attachment: new.attachment.clone(),
            is_read: false,
            is_deleted: false,
            created_at,
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let message = self
            .conn()
            .query_row(&sql, params![id.to_string()], row_to_message)
            .optional()?;
        Ok(message)
    }

    /// Permanently remove a message. Returns `false` if it did not exist.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// The `limit` most recent non-deleted messages between `a` and `b`,
    /// oldest first.
    pub fn get_conversation(&self, a: UserId, b: UserId, limit: u32) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE ((sender_id = ?1 AND receiver_id = ?2)
                     OR (sender_id = ?2 AND receiver_id = ?1))
                   AND is_deleted = 0
                 ORDER BY seq DESC
                 LIMIT ?3
             )
             ORDER BY seq ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![a.to_string(), b.to_string(), limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Mark everything `peer` sent to `reader` as read. Returns the number of
    /// messages that changed.
    pub fn mark_conversation_read(&self, reader: UserId, peer: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_read = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![peer.to_string(), reader.to_string()],
        )?;
        Ok(affected)
    }

    /// Fetch a conversation on behalf of `reader`, then mark `peer`'s
    /// messages as read. The returned messages reflect the read state before
    /// the fetch.
    pub fn read_conversation(
        &self,
        reader: UserId,
        peer: UserId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let tx = self.conn().unchecked_transaction()?;
        let messages = self.get_conversation(reader, peer, limit)?;
        let marked = self.mark_conversation_read(reader, peer)?;
        tx.commit()?;

        if marked > 0 {
            tracing::debug!(reader = %reader, peer = %peer, marked, "marked messages read");
        }
        Ok(messages)
    }

    /// One summary per conversation partner, most recent activity first.
    pub fn conversation_summaries(&self, user: UserId) -> Result<Vec<ConversationSummary>> {
        let sql = format!(
            "SELECT {cols},
                    u.id, u.username, u.email, u.avatar, u.created_at,
                    (SELECT COUNT(*) FROM messages r
                      WHERE r.sender_id = u.id AND r.receiver_id = ?1
                        AND r.is_read = 0 AND r.is_deleted = 0) AS unread
             FROM messages m
             JOIN (
                 SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS partner,
                        MAX(seq) AS last_seq
                 FROM messages
                 WHERE (sender_id = ?1 OR receiver_id = ?1) AND is_deleted = 0
                 GROUP BY partner
             ) latest ON m.seq = latest.last_seq
             JOIN users u ON u.id = latest.partner
             ORDER BY m.seq DESC",
            cols = MESSAGE_COLUMNS
                .split(", ")
                .map(|c| format!("m.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let message = row_to_message(row)?;
            let partner = user_at(row, MESSAGE_WIDTH)?;
            let unread: i64 = row.get(MESSAGE_WIDTH + 5)?;
            Ok(ConversationSummary {
                friend: FriendRef::from(&partner),
                last_message: message.preview(),
                last_message_id: message.id,
                timestamp: message.created_at,
                unread_count: saturating_count(unread),
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }
}

/// SQLite counts are `i64`; saturate rather than wrap.
fn saturating_count(raw: i64) -> u32 {
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let receiver_str: String = row.get(3)?;
    let body: Option<String> = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let file_url: Option<String> = row.get(6)?;
    let file_name: Option<String> = row.get(7)?;
    let file_size: Option<i64> = row.get(8)?;
    let file_type: Option<String> = row.get(9)?;
    let is_read: bool = row.get(10)?;
    let is_deleted: bool = row.get(11)?;
    let ts_str: String = row.get(12)?;

    let kind = MessageKind::from_name(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown message kind '{kind_str}'").into(),
        )
    })?;

    let attachment = file_url.map(|url| Attachment {
        name: file_name.unwrap_or_else(|| file_name_from_url(&url)),
        url,
        size: file_size.and_then(|s| u64::try_from(s).ok()),
        mime_type: file_type,
    });

    Ok(Message {
        id: MessageId(parse_uuid(1, &id_str)?),
        seq,
        sender_id: UserId(parse_uuid(2, &sender_str)?),
        receiver_id: UserId(parse_uuid(3, &receiver_str)?),
        body,
        kind,
        attachment,
        is_read,
        is_deleted,
        created_at: parse_ts(12, &ts_str)?,
    })
}

/// Last path segment of a URL, used when a client omits the file name.
pub fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').find(|seg| !seg.is_empty()))
        .unwrap_or("file")
        .to_string()
}

pub(crate) fn parse_uuid(col: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn setup() -> (Database, User, User, User) {
        let db = Database::open_in_memory().unwrap();
        let (a, b, c) = (User::new("alice"), User::new("bob"), User::new("carol"));
        for u in [&a, &b, &c] {
            db.insert_user(u).unwrap();
        }
        (db, a, b, c)
    }

    fn image(sender: UserId, receiver: UserId, url: &str) -> NewMessage {
        NewMessage {
            sender_id: sender,
            receiver_id: receiver,
            body: None,
            kind: MessageKind::Image,
            attachment: Some(Attachment {
                url: url.to_string(),
                name: "y.png".to_string(),
                size: Some(2048),
                mime_type: Some("image/png".to_string()),
            }),
        }
    }

    #[test]
    fn insert_assigns_increasing_seq() {
        let (db, a, b, _) = setup();
        let first = db.insert_message(&NewMessage::text(a.id, b.id, "one")).unwrap();
        let second = db.insert_message(&NewMessage::text(b.id, a.id, "two")).unwrap();

        assert!(second.seq > first.seq);
        assert!(!first.is_read);
        assert!(!first.is_deleted);

        let stored = db.get_message(first.id).unwrap().unwrap();
        assert_eq!(stored, first);
    }

    #[test]
    fn attachment_round_trips() {
        let (db, a, b, _) = setup();
        let sent = db.insert_message(&image(a.id, b.id, "https://x/y.png")).unwrap();
        let stored = db.get_message(sent.id).unwrap().unwrap();

        let attachment = stored.attachment.unwrap();
        assert_eq!(stored.kind, MessageKind::Image);
        assert_eq!(attachment.url, "https://x/y.png");
        assert_eq!(attachment.size, Some(2048));
    }

    #[test]
    fn attachment_must_match_kind() {
        let (db, a, b, _) = setup();
        let mut bad = image(a.id, b.id, "https://x/y.png");
        bad.attachment = None;
        assert!(matches!(db.insert_message(&bad), Err(StoreError::Invalid(_))));

        let mut bad_text = NewMessage::text(a.id, b.id, "hi");
        bad_text.attachment = image(a.id, b.id, "https://x/z.png").attachment;
        assert!(db.insert_message(&bad_text).is_err());
    }

    #[test]
    fn oversized_file_size_is_rejected() {
        let (db, a, b, _) = setup();
        let mut huge = image(a.id, b.id, "https://x/y.png");
        if let Some(att) = huge.attachment.as_mut() {
            att.size = Some(u64::MAX);
        }
        assert!(matches!(db.insert_message(&huge), Err(StoreError::Invalid(_))));
        assert!(db.get_conversation(a.id, b.id, 100).unwrap().is_empty());
    }

    #[test]
    fn conversation_is_ordered_and_capped() {
        let (db, a, b, c) = setup();
        for i in 0..5 {
            db.insert_message(&NewMessage::text(a.id, b.id, format!("m{i}")))
                .unwrap();
        }
        db.insert_message(&NewMessage::text(a.id, c.id, "elsewhere"))
            .unwrap();

        let all = db.get_conversation(b.id, a.id, 100).unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);

        let recent = db.get_conversation(a.id, b.id, 2).unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m3", "m4"]);
    }

    #[test]
    fn read_conversation_marks_only_incoming() {
        let (db, a, b, _) = setup();
        let incoming = db.insert_message(&NewMessage::text(a.id, b.id, "hi")).unwrap();
        let outgoing = db.insert_message(&NewMessage::text(b.id, a.id, "hey")).unwrap();

        let first = db.read_conversation(b.id, a.id, 100).unwrap();
        assert!(first.iter().all(|m| !m.is_read));

        let second = db.read_conversation(b.id, a.id, 100).unwrap();
        let ids: Vec<_> = second.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![incoming.id, outgoing.id]);
        assert!(second[0].is_read);
        assert!(!second[1].is_read);
    }

    #[test]
    fn delete_is_permanent() {
        let (db, a, b, _) = setup();
        let m = db.insert_message(&NewMessage::text(a.id, b.id, "oops")).unwrap();

        assert!(db.delete_message(m.id).unwrap());
        assert!(db.get_message(m.id).unwrap().is_none());
        assert!(db.get_conversation(a.id, b.id, 100).unwrap().is_empty());
        assert!(!db.delete_message(m.id).unwrap());
    }

    #[test]
    fn summaries_per_partner() {
        let (db, a, b, c) = setup();
        db.insert_message(&NewMessage::text(b.id, a.id, "hello")).unwrap();
        db.insert_message(&NewMessage::text(b.id, a.id, "you there?")).unwrap();
        db.insert_message(&NewMessage::text(a.id, c.id, "hi carol")).unwrap();
        let mut file = image(c.id, a.id, "https://x/report.pdf");
        file.kind = MessageKind::File;
        if let Some(att) = file.attachment.as_mut() {
            att.name = "report.pdf".into();
        }
        db.insert_message(&file).unwrap();

        let summaries = db.conversation_summaries(a.id).unwrap();
        assert_eq!(summaries.len(), 2);

        assert_eq!(summaries[0].friend.id, c.id);
        assert_eq!(summaries[0].last_message, "📎 report.pdf");
        assert_eq!(summaries[0].unread_count, 1);

        assert_eq!(summaries[1].friend.username, "bob");
        assert_eq!(summaries[1].last_message, "you there?");
        assert_eq!(summaries[1].unread_count, 2);

        db.read_conversation(a.id, b.id, 100).unwrap();
        let summaries = db.conversation_summaries(a.id).unwrap();
        assert_eq!(summaries[1].unread_count, 0);
    }

    #[test]
    fn unread_count_saturates() {
        assert_eq!(saturating_count(3), 3);
        assert_eq!(saturating_count(i64::from(u32::MAX) + 10), u32::MAX);
        assert_eq!(saturating_count(-1), 0);
    }

    #[test]
    fn file_name_fallback() {
        assert_eq!(file_name_from_url("https://x/y.png"), "y.png");
        assert_eq!(file_name_from_url("https://x/a/b.pdf?sig=1"), "b.pdf");
        assert_eq!(file_name_from_url(""), "file");
    }
}
