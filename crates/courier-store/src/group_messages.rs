use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

use courier_shared::types::{GroupId, MessageId, MessageStatus, UserId};

use crate::codec::{
    encode_json, encode_opt_ts, encode_ts, json_at, opt_parsed_at, parsed_at, ts_at,
};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{GroupLogRow, Page, PageQuery};

const SELECT_COLUMNS: &str = "message_id, group_id, sender_id, content, file_type, kind,
     status, target_message_id, metadata, created_at, updated_at";

const BASE_ONLY: &str = "kind NOT IN ('recall_record', 'delete_record')";

impl Database {
    /// Append a base message or a tombstone to a group's log.
    pub fn insert_group_entry(&self, entry: &GroupLogRow) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO group_messages ({SELECT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                entry.message_id.to_string(),
                entry.group_id.as_str(),
                entry.sender_id.as_str(),
                entry.content,
                entry.file_type,
                entry.kind.as_str(),
                entry.status.as_str(),
                entry.target_message_id.map(|id| id.to_string()),
                encode_json(&entry.metadata),
                encode_ts(&entry.created_at),
                encode_ts(&entry.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch a base message of a group. Tombstones are never returned.
    pub fn get_group_message(&self, group: &GroupId, id: &MessageId) -> Result<GroupLogRow> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM group_messages
                     WHERE group_id = ?1 AND message_id = ?2 AND {BASE_ONLY}"
                ),
                params![group.as_str(), id.to_string()],
                row_to_entry,
            )
            .map_err(StoreError::from_query)
    }

    /// Rewrite a base row as recalled. Returns whether the row existed.
    pub fn mark_group_message_recalled(
        &self,
        group: &GroupId,
        id: &MessageId,
        placeholder: &str,
        metadata: &serde_json::Value,
        at: &DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            &format!(
                "UPDATE group_messages
                 SET status = ?3, content = ?4, metadata = ?5, updated_at = ?6
                 WHERE group_id = ?1 AND message_id = ?2 AND {BASE_ONLY}"
            ),
            params![
                group.as_str(),
                id.to_string(),
                MessageStatus::Recalled.as_str(),
                placeholder,
                encode_json(metadata),
                encode_ts(at),
            ],
        )?;
        Ok(affected > 0)
    }

    /// A page of base rows, keyed on `(created_at, message_id)`.
    pub fn list_group_base_rows(
        &self,
        group: &GroupId,
        query: &PageQuery,
    ) -> Result<Page<GroupLogRow>> {
        let (order, cmp) = if query.ascending {
            ("ASC", ">")
        } else {
            ("DESC", "<")
        };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM group_messages
             WHERE group_id = ?1 AND {BASE_ONLY}
               AND (?2 IS NULL OR created_at >= ?2)
               AND (?3 IS NULL OR created_at < ?3)
               AND (?4 IS NULL OR (created_at, message_id) {cmp} (?4, ?5))
             ORDER BY created_at {order}, message_id {order}
             LIMIT ?6"
        );

        let limit = query.limit.max(1);
        let (key_ts, key_id) = match &query.after_key {
            Some((ts, id)) => (Some(encode_ts(ts)), Some(id.to_string())),
            None => (None, None),
        };

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                group.as_str(),
                encode_opt_ts(query.since.as_ref()),
                encode_opt_ts(query.until.as_ref()),
                key_ts,
                key_id,
                i64::from(limit) + 1,
            ],
            row_to_entry,
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
        Ok(Page { items, has_more })
    }

    /// Every tombstone of `group` whose target is one of `targets`, in log
    /// order.
    pub fn group_tombstones_for(
        &self,
        group: &GroupId,
        targets: &[MessageId],
    ) -> Result<Vec<GroupLogRow>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..targets.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM group_messages
             WHERE group_id = ?1 AND target_message_id IN ({placeholders})
             ORDER BY created_at ASC"
        );

        let mut values = Vec::with_capacity(targets.len() + 1);
        values.push(Value::Text(group.0.clone()));
        values.extend(targets.iter().map(|id| Value::Text(id.to_string())));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_entry)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Base messages of `group` sent by someone other than `user` after
    /// `since` (all of them when `since` is `None`).
    pub fn count_group_messages_since(
        &self,
        group: &GroupId,
        user: &UserId,
        since: Option<&DateTime<Utc>>,
    ) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM group_messages
                 WHERE group_id = ?1 AND sender_id != ?2 AND {BASE_ONLY}
                   AND kind != 'system'
                   AND (?3 IS NULL OR created_at > ?3)"
            ),
            params![group.as_str(), user.as_str(), encode_opt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupLogRow> {
    let group_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;

    Ok(GroupLogRow {
        message_id: parsed_at(row, 0)?,
        group_id: GroupId(group_id),
        sender_id: UserId(sender_id),
        content: row.get(3)?,
        file_type: row.get(4)?,
        kind: parsed_at(row, 5)?,
        status: parsed_at(row, 6)?,
        target_message_id: opt_parsed_at(row, 7)?,
        metadata: json_at(row, 8)?,
        created_at: ts_at(row, 9)?,
        updated_at: ts_at(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_shared::types::GroupEntryKind;

    fn seed(db: &Database, group: &GroupId, n: i64, t0: DateTime<Utc>) -> Vec<GroupLogRow> {
        (0..n)
            .map(|i| {
                let sender = if i % 2 == 0 { "alice" } else { "bob" };
                let row = GroupLogRow::base(
                    group,
                    &UserId::from(sender),
                    format!("m{i}"),
                    GroupEntryKind::Text,
                    None,
                    t0 + Duration::seconds(i),
                );
                db.insert_group_entry(&row).unwrap();
                row
            })
            .collect()
    }

    #[test]
    fn keyset_paging_walks_the_log() {
        let db = Database::open_in_memory().unwrap();
        let group = GroupId::from("g1");
        seed(&db, &group, 5, Utc::now());

        let mut query = PageQuery { limit: 2, ..Default::default() };
        let first = db.list_group_base_rows(&group, &query).unwrap();
        assert!(first.has_more);
        assert_eq!(first.items[0].content, "m4");

        let last = first.items.last().unwrap();
        query.after_key = Some((last.created_at, last.message_id));
        let second = db.list_group_base_rows(&group, &query).unwrap();
        assert_eq!(second.items[0].content, "m2");
    }

    #[test]
    fn tombstones_are_excluded_from_base_reads() {
        let db = Database::open_in_memory().unwrap();
        let group = GroupId::from("g1");
        let rows = seed(&db, &group, 2, Utc::now());

        let tomb = GroupLogRow::tombstone(
            &group,
            &UserId::from("bob"),
            GroupEntryKind::DeleteRecord,
            rows[0].message_id,
            serde_json::json!({ "deletedBy": "bob" }),
            Utc::now(),
        );
        db.insert_group_entry(&tomb).unwrap();

        let page = db
            .list_group_base_rows(&group, &PageQuery { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(matches!(
            db.get_group_message(&group, &tomb.message_id),
            Err(StoreError::NotFound)
        ));

        let found = db
            .group_tombstones_for(&group, &[rows[0].message_id, rows[1].message_id])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target_message_id, Some(rows[0].message_id));
    }

    #[test]
    fn unread_counts_only_other_senders() {
        let db = Database::open_in_memory().unwrap();
        let group = GroupId::from("g1");
        let t0 = Utc::now();
        seed(&db, &group, 4, t0);

        let alice = UserId::from("alice");
        assert_eq!(db.count_group_messages_since(&group, &alice, None).unwrap(), 2);
        let cutoff = t0 + Duration::milliseconds(1500);
        assert_eq!(
            db.count_group_messages_since(&group, &alice, Some(&cutoff)).unwrap(),
            1
        );
    }
}
