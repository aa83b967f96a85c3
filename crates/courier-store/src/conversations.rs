use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::types::{ConversationId, UserId};

use crate::codec::{encode_ts, opt_ts_at, parsed_at, ts_at};
use crate::database::Database;
use crate::error::Result;
use crate::models::{ConversationRow, LastMessage, Page, UnreadUpdate};

const SELECT_COLUMNS: &str = "conversation_id, participant_id, other_participant_id,
     last_content, last_sender_id, last_kind, last_file_type, last_timestamp,
     unread_count, created_at, updated_at";

impl Database {
    /// Earliest `created_at` across the rows of a conversation, if any exist.
    pub fn conversation_created_at(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let ts = self.conn().query_row(
            "SELECT MIN(created_at) FROM conversations WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
            |row| opt_ts_at(row, 0),
        )?;
        Ok(ts)
    }

    /// Insert or update one participant's row.
    ///
    /// `created_at` is only written on insert. The unread counter is adjusted
    /// according to `unread`.
    pub fn put_conversation_row(&self, row: &ConversationRow, unread: UnreadUpdate) -> Result<()> {
        let (initial_unread, unread_sql) = match unread {
            UnreadUpdate::Increment => (1, "conversations.unread_count + 1"),
            UnreadUpdate::Reset => (0, "0"),
            UnreadUpdate::Keep => (0, "conversations.unread_count"),
        };

        let sql = format!(
            "INSERT INTO conversations ({SELECT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(conversation_id, participant_id) DO UPDATE SET
                 other_participant_id = excluded.other_participant_id,
                 last_content         = excluded.last_content,
                 last_sender_id       = excluded.last_sender_id,
                 last_kind            = excluded.last_kind,
                 last_file_type       = excluded.last_file_type,
                 last_timestamp       = excluded.last_timestamp,
                 unread_count         = {unread_sql},
                 updated_at           = excluded.updated_at"
        );

        self.conn().execute(
            &sql,
            params![
                row.conversation_id.as_str(),
                row.participant_id.as_str(),
                row.other_participant_id.as_str(),
                row.last_message.content,
                row.last_message.sender_id.as_str(),
                row.last_message.kind.as_str(),
                row.last_message.file_type,
                encode_ts(&row.last_message.timestamp),
                initial_unread,
                encode_ts(&row.created_at),
                encode_ts(&row.updated_at),
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get_conversation_row(
        &self,
        conversation_id: &ConversationId,
        participant: &UserId,
    ) -> Result<Option<ConversationRow>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM conversations
                     WHERE conversation_id = ?1 AND participant_id = ?2"
                ),
                params![conversation_id.as_str(), participant.as_str()],
                row_to_conversation,
            )
            .optional()?;
        Ok(row)
    }

    /// One row per conversation `user` takes part in, newest first.
    ///
    /// Both row shapes are matched (`user` as owner or as the other side).
    /// When both rows of a conversation match, the most recently updated one
    /// wins, and on a tie the row `user` owns. `after` is the
    /// `(updated_at, conversation_id)` of the last entry of the previous page.
    pub fn conversation_page_for_user(
        &self,
        user: &UserId,
        after: Option<(&DateTime<Utc>, &ConversationId)>,
        limit: u32,
    ) -> Result<Page<ConversationRow>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM (
                 SELECT {SELECT_COLUMNS}, ROW_NUMBER() OVER (
                     PARTITION BY conversation_id
                     ORDER BY updated_at DESC, (participant_id = ?1) DESC
                 ) AS pick
                 FROM conversations
                 WHERE participant_id = ?1 OR other_participant_id = ?1
             )
             WHERE pick = 1
               AND (?2 IS NULL
                    OR updated_at < ?2
                    OR (updated_at = ?2 AND conversation_id < ?3))
             ORDER BY updated_at DESC, conversation_id DESC
             LIMIT ?4"
        );

        let limit = limit.max(1);
        let (after_ts, after_id) = match after {
            Some((ts, id)) => (Some(encode_ts(ts)), Some(id.as_str())),
            None => (None, None),
        };

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![user.as_str(), after_ts, after_id, i64::from(limit) + 1],
            row_to_conversation,
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
        Ok(Page { items, has_more })
    }

    /// Zero the unread counter on `participant`'s row. Returns whether a row
    /// existed.
    pub fn reset_conversation_unread(
        &self,
        conversation_id: &ConversationId,
        participant: &UserId,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET unread_count = 0
             WHERE conversation_id = ?1 AND participant_id = ?2",
            params![conversation_id.as_str(), participant.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let conversation_id: String = row.get(0)?;
    let participant_id: String = row.get(1)?;
    let other_participant_id: String = row.get(2)?;
    let last_sender_id: String = row.get(4)?;
    let unread_count: i64 = row.get(8)?;

    Ok(ConversationRow {
        conversation_id: ConversationId(conversation_id),
        participant_id: UserId(participant_id),
        other_participant_id: UserId(other_participant_id),
        last_message: LastMessage {
            content: row.get(3)?,
            sender_id: UserId(last_sender_id),
            kind: parsed_at(row, 5)?,
            file_type: row.get(6)?,
            timestamp: ts_at(row, 7)?,
        },
        unread_count: unread_count.max(0) as u64,
        created_at: ts_at(row, 9)?,
        updated_at: ts_at(row, 10)?,
    })
}
