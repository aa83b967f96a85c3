use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

use courier_shared::types::{ConversationId, MessageId, MessageStatus, UserId};

use crate::codec::{encode_json, encode_ts, json_at, opt_parsed_at, parsed_at, ts_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{DirectMessage, Page, PageQuery};

const SELECT_COLUMNS: &str = "message_id, conversation_id, sender_id, receiver_id, content,
     file_type, timestamp, status, kind, call_id, call_status, duration_secs, metadata";

const INSERT_SQL: &str = "INSERT INTO messages (message_id, conversation_id, sender_id,
     receiver_id, content, file_type, timestamp, status, kind, call_id, call_status,
     duration_secs, metadata)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

impl Database {
    pub fn insert_message(&self, message: &DirectMessage) -> Result<()> {
        self.conn()
            .execute(INSERT_SQL, params_from_iter(message_params(message)))?;
        Ok(())
    }

    /// Insert unless a message with the same
    /// `(conversation_id, call_id, call_status)` already exists.
    ///
    /// Returns `false` when the insert was absorbed as a duplicate.
    pub fn insert_message_if_absent(&self, message: &DirectMessage) -> Result<bool> {
        let sql = format!(
            "{INSERT_SQL} ON CONFLICT(conversation_id, call_id, call_status) DO NOTHING"
        );
        let affected = self
            .conn()
            .execute(&sql, params_from_iter(message_params(message)))?;
        Ok(affected > 0)
    }

    pub fn get_message(&self, id: &MessageId) -> Result<DirectMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM messages WHERE message_id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(StoreError::from_query)
    }

    /// Look a message up inside a specific conversation.
    pub fn get_conversation_message(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
    ) -> Result<DirectMessage> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND message_id = ?2"
                ),
                params![conversation_id.as_str(), id.to_string()],
                row_to_message,
            )
            .map_err(StoreError::from_query)
    }

    /// Set the status and optionally rewrite the content. Returns whether the
    /// message existed.
    pub fn update_message_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
        content: Option<&str>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, content = COALESCE(?3, content)
             WHERE message_id = ?1",
            params![id.to_string(), status.as_str(), content],
        )?;
        Ok(affected > 0)
    }

    /// A window of a conversation's history.
    ///
    /// `query.after_key` is ignored; direct history pages by time bounds.
    pub fn list_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        query: &PageQuery,
    ) -> Result<Page<DirectMessage>> {
        let order = if query.ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM messages
             WHERE conversation_id = ?1
               AND (?2 IS NULL OR timestamp >= ?2)
               AND (?3 IS NULL OR timestamp < ?3)
             ORDER BY timestamp {order}, message_id {order}
             LIMIT ?4"
        );

        let limit = query.limit.max(1);
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                conversation_id.as_str(),
                query.since.as_ref().map(encode_ts),
                query.until.as_ref().map(encode_ts),
                i64::from(limit) + 1,
            ],
            row_to_message,
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
        Ok(Page { items, has_more })
    }
}

fn message_params(m: &DirectMessage) -> [Value; 13] {
    [
        Value::Text(m.message_id.to_string()),
        Value::Text(m.conversation_id.0.clone()),
        Value::Text(m.sender_id.0.clone()),
        Value::Text(m.receiver_id.0.clone()),
        Value::Text(m.content.clone()),
        opt_text(m.file_type.clone()),
        Value::Text(encode_ts(&m.timestamp)),
        Value::Text(m.status.as_str().to_string()),
        Value::Text(m.kind.as_str().to_string()),
        opt_text(m.call_id.map(|id| id.to_string())),
        opt_text(m.call_status.map(|s| s.as_str().to_string())),
        m.duration_secs.map(Value::Integer).unwrap_or(Value::Null),
        opt_text(encode_json(&m.metadata)),
    ]
}

fn opt_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectMessage> {
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let receiver_id: String = row.get(3)?;

    Ok(DirectMessage {
        message_id: parsed_at(row, 0)?,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        content: row.get(4)?,
        file_type: row.get(5)?,
        timestamp: ts_at(row, 6)?,
        status: parsed_at(row, 7)?,
        kind: parsed_at(row, 8)?,
        call_id: opt_parsed_at(row, 9)?,
        call_status: opt_parsed_at(row, 10)?,
        duration_secs: row.get(11)?,
        metadata: json_at(row, 12)?,
    })
}

/// Lookups used to check call-message deduplication from tests.
#[cfg(any(test, feature = "test-support"))]
mod inspect {
    use rusqlite::{params, OptionalExtension};

    use courier_shared::types::{CallId, CallMessageStatus, ConversationId};

    use super::{row_to_message, SELECT_COLUMNS};
    use crate::database::Database;
    use crate::error::Result;
    use crate::models::DirectMessage;

    impl Database {
        /// The call message recorded for a given call transition, if any.
        pub fn find_call_message(
            &self,
            conversation_id: &ConversationId,
            call_id: &CallId,
            call_status: CallMessageStatus,
        ) -> Result<Option<DirectMessage>> {
            let message = self
                .conn()
                .query_row(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM messages
                         WHERE conversation_id = ?1 AND call_id = ?2 AND call_status = ?3"
                    ),
                    params![conversation_id.as_str(), call_id.to_string(), call_status.as_str()],
                    row_to_message,
                )
                .optional()?;
            Ok(message)
        }

        pub fn count_call_messages(&self, call_id: &CallId) -> Result<u64> {
            let n: i64 = self.conn().query_row(
                "SELECT COUNT(*) FROM messages WHERE call_id = ?1",
                params![call_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use courier_shared::types::{CallId, CallMessageStatus, MessageKind};

    fn call_message(call_id: CallId, status: CallMessageStatus) -> DirectMessage {
        let mut m = DirectMessage::new(
            &UserId::from("a"),
            &UserId::from("b"),
            "Video call started",
            MessageKind::Call,
            None,
            Utc::now(),
        );
        m.call_id = Some(call_id);
        m.call_status = Some(status);
        m
    }

    #[test]
    fn call_messages_are_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        let call = CallId::new();

        assert!(db.insert_message_if_absent(&call_message(call, CallMessageStatus::Started)).unwrap());
        assert!(!db.insert_message_if_absent(&call_message(call, CallMessageStatus::Started)).unwrap());
        assert!(db.insert_message_if_absent(&call_message(call, CallMessageStatus::Ended)).unwrap());

        assert_eq!(db.count_call_messages(&call).unwrap(), 2);
    }

    #[test]
    fn text_messages_never_collide_on_the_call_index() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        for text in ["one", "two"] {
            let m = DirectMessage::new(&a, &b, text, MessageKind::Text, None, Utc::now());
            assert!(db.insert_message_if_absent(&m).unwrap());
        }
    }

    #[test]
    fn reinserting_an_id_is_a_constraint_violation() {
        let db = Database::open_in_memory().unwrap();
        let m = call_message(CallId::new(), CallMessageStatus::Started);
        db.insert_message(&m).unwrap();

        let err = db.insert_message(&m).unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(!StoreError::NotFound.is_constraint_violation());
    }

    #[test]
    fn status_update_rewrites_content() {
        let db = Database::open_in_memory().unwrap();
        let m = DirectMessage::new(
            &UserId::from("a"),
            &UserId::from("b"),
            "secret",
            MessageKind::Text,
            None,
            Utc::now(),
        );
        db.insert_message(&m).unwrap();

        assert!(db
            .update_message_status(&m.message_id, MessageStatus::Recalled, Some("gone"))
            .unwrap());
        let stored = db.get_conversation_message(&m.conversation_id, &m.message_id).unwrap();
        assert_eq!(stored.status, MessageStatus::Recalled);
        assert_eq!(stored.content, "gone");

        assert!(matches!(
            db.get_message(&MessageId::new()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn history_pages_report_has_more() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        let t0 = Utc::now();
        for i in 0..5 {
            let m = DirectMessage::new(
                &a,
                &b,
                format!("m{i}"),
                MessageKind::Text,
                None,
                t0 + Duration::seconds(i),
            );
            db.insert_message(&m).unwrap();
        }

        let conv = ConversationId::between(&a, &b);
        let page = db
            .list_conversation_messages(&conv, &PageQuery { limit: 3, ..Default::default() })
            .unwrap();
        assert!(page.has_more);
        assert_eq!(page.items[0].content, "m4");

        let page = db
            .list_conversation_messages(
                &conv,
                &PageQuery { limit: 10, ascending: true, ..Default::default() },
            )
            .unwrap();
        assert!(!page.has_more);
        assert_eq!(page.items[0].content, "m0");
    }
}
