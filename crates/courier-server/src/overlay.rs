//! Reconciles the group log into the view one member sees.
//!
//! The log is append-only: base messages plus `recall_record` and
//! `delete_record` tombstones pointing at them. [`reduce`] is a pure function
//! of the entries and the viewer, so the result does not depend on the order
//! tombstones were written in.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;

use courier_shared::constants::RECALL_PLACEHOLDER;
use courier_shared::protocol::GroupMessagePayload;
use courier_shared::types::{GroupEntryKind, MessageId, MessageStatus, UserId};
use courier_store::GroupLogRow;

#[derive(Debug, Clone)]
pub enum LogEntry {
    Base(GroupLogRow),
    Recall {
        target: MessageId,
        recalled_by: UserId,
        recalled_at: DateTime<Utc>,
    },
    Delete {
        target: MessageId,
        deleted_by: UserId,
    },
}

impl LogEntry {
    /// Classify a stored row. Tombstones without a resolvable target are
    /// dropped.
    pub fn from_row(row: GroupLogRow) -> Option<Self> {
        match row.kind {
            GroupEntryKind::RecallRecord => {
                let target = tombstone_target(&row, "originalMessageId")?;
                let recalled_by = metadata_user(&row, "recalledBy").unwrap_or(row.sender_id);
                Some(LogEntry::Recall {
                    target,
                    recalled_by,
                    recalled_at: row.created_at,
                })
            }
            GroupEntryKind::DeleteRecord => {
                let target = tombstone_target(&row, "deletedMessageId")?;
                let deleted_by = metadata_user(&row, "deletedBy").unwrap_or(row.sender_id);
                Some(LogEntry::Delete { target, deleted_by })
            }
            _ => Some(LogEntry::Base(row)),
        }
    }
}

fn tombstone_target(row: &GroupLogRow, key: &str) -> Option<MessageId> {
    row.target_message_id.or_else(|| {
        row.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    })
}

fn metadata_user(row: &GroupLogRow, key: &str) -> Option<UserId> {
    row.metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(UserId::from)
}

/// Merge base messages with their tombstones for `viewer`.
///
/// Recalls show the placeholder to everyone; deletes hide the message from
/// the member who deleted it only. Output is ordered by creation time, newest
/// first unless `ascending`.
pub fn reduce<I>(entries: I, viewer: &UserId, ascending: bool) -> Vec<GroupMessagePayload>
where
    I: IntoIterator<Item = LogEntry>,
{
    let mut bases: Vec<GroupLogRow> = Vec::new();
    let mut recalls: HashMap<MessageId, (UserId, DateTime<Utc>)> = HashMap::new();
    let mut hidden: HashSet<MessageId> = HashSet::new();

    for entry in entries {
        match entry {
            LogEntry::Base(row) => bases.push(row),
            LogEntry::Recall {
                target,
                recalled_by,
                recalled_at,
            } => {
                // Earliest recall wins if several were recorded.
                recalls
                    .entry(target)
                    .and_modify(|existing| {
                        if recalled_at < existing.1 {
                            *existing = (recalled_by.clone(), recalled_at);
                        }
                    })
                    .or_insert((recalled_by, recalled_at));
            }
            LogEntry::Delete { target, deleted_by } => {
                if &deleted_by == viewer {
                    hidden.insert(target);
                }
            }
        }
    }

    let mut seen = HashSet::new();
    let mut out: Vec<GroupMessagePayload> = bases
        .into_iter()
        .filter(|row| seen.insert(row.message_id))
        .filter(|row| !hidden.contains(&row.message_id))
        .map(|row| {
            let mut payload = GroupMessagePayload::from(&row);
            if let Some((by, at)) = recalls.get(&row.message_id) {
                apply_recall(&mut payload, by, *at);
            } else if row.status == MessageStatus::Recalled {
                payload.content = RECALL_PLACEHOLDER.to_string();
            }
            payload
        })
        .collect();

    out.sort_by(|a, b| {
        let ord = a
            .created_at
            .cmp(&b.created_at)
            .then_with(|| a.message_id.0.cmp(&b.message_id.0));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    out
}

fn apply_recall(payload: &mut GroupMessagePayload, by: &UserId, at: DateTime<Utc>) {
    payload.content = RECALL_PLACEHOLDER.to_string();
    payload.status = MessageStatus::Recalled;
    payload.is_recalled = true;
    if payload.recalled_by.is_none() {
        payload.recalled_by = Some(by.clone());
    }
    if payload.recalled_at.is_none() {
        payload.recalled_at = Some(at);
    }
}

/// Messages of one calendar day in the viewer's timezone.
#[derive(Debug, Clone, Serialize)]
pub struct DayGroup<T> {
    pub date: NaiveDate,
    pub messages: Vec<T>,
}

/// Split an already ordered list into consecutive calendar days.
pub fn group_by_day<T, F>(items: Vec<T>, offset: FixedOffset, timestamp: F) -> Vec<DayGroup<T>>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    let mut groups: Vec<DayGroup<T>> = Vec::new();
    for item in items {
        let date = timestamp(&item).with_timezone(&offset).date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(item),
            _ => groups.push(DayGroup {
                date,
                messages: vec![item],
            }),
        }
    }
    groups
}

/// Viewer offset in minutes east of UTC, clamped to real-world bounds.
pub fn viewer_offset(minutes: Option<i32>) -> FixedOffset {
    let secs = minutes.unwrap_or(0).clamp(-14 * 60, 14 * 60) * 60;
    FixedOffset::east_opt(secs).unwrap_or(Utc.fix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use courier_shared::types::GroupId;

    fn base(sender: &str, content: &str, at: DateTime<Utc>) -> GroupLogRow {
        GroupLogRow::base(
            &GroupId::from("g1"),
            &UserId::from(sender),
            content,
            GroupEntryKind::Text,
            None,
            at,
        )
    }

    fn recall(target: MessageId, by: &str, at: DateTime<Utc>) -> LogEntry {
        LogEntry::Recall {
            target,
            recalled_by: UserId::from(by),
            recalled_at: at,
        }
    }

    #[test]
    fn delete_hides_only_for_the_deleter() {
        let t0 = Utc::now();
        let m = base("alice", "hi", t0);
        let entries = || {
            vec![
                LogEntry::Base(m.clone()),
                LogEntry::Delete {
                    target: m.message_id,
                    deleted_by: UserId::from("bob"),
                },
            ]
        };

        assert!(reduce(entries(), &UserId::from("bob"), false).is_empty());
        let for_carol = reduce(entries(), &UserId::from("carol"), false);
        assert_eq!(for_carol.len(), 1);
        assert_eq!(for_carol[0].content, "hi");
    }

    #[test]
    fn recall_applies_regardless_of_tombstone_order() {
        let t0 = Utc::now();
        let m = base("alice", "secret", t0);
        let r = recall(m.message_id, "alice", t0 + Duration::seconds(5));

        let before = reduce(
            vec![r.clone(), LogEntry::Base(m.clone())],
            &UserId::from("bob"),
            false,
        );
        let after = reduce(vec![LogEntry::Base(m), r], &UserId::from("carol"), false);

        for view in [before, after] {
            assert_eq!(view.len(), 1);
            assert_eq!(view[0].content, RECALL_PLACEHOLDER);
            assert!(view[0].is_recalled);
            assert_eq!(view[0].recalled_by, Some(UserId::from("alice")));
        }
    }

    #[test]
    fn tombstones_for_unknown_targets_are_ignored() {
        let t0 = Utc::now();
        let m = base("alice", "kept", t0);
        let view = reduce(
            vec![
                LogEntry::Base(m),
                recall(MessageId::new(), "alice", t0),
                LogEntry::Delete {
                    target: MessageId::new(),
                    deleted_by: UserId::from("bob"),
                },
            ],
            &UserId::from("bob"),
            true,
        );
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].content, "kept");
    }

    #[test]
    fn ordering_follows_direction() {
        let t0 = Utc::now();
        let a = base("alice", "first", t0);
        let b = base("bob", "second", t0 + Duration::seconds(1));
        let entries = vec![LogEntry::Base(b), LogEntry::Base(a)];

        let newest_first = reduce(entries.clone(), &UserId::from("x"), false);
        assert_eq!(newest_first[0].content, "second");
        let oldest_first = reduce(entries, &UserId::from("x"), true);
        assert_eq!(oldest_first[0].content, "first");
    }

    #[test]
    fn rows_classify_into_entries() {
        let t0 = Utc::now();
        let m = base("alice", "hi", t0);
        let tomb = GroupLogRow::tombstone(
            &GroupId::from("g1"),
            &UserId::from("bob"),
            GroupEntryKind::DeleteRecord,
            m.message_id,
            serde_json::json!({ "deletedMessageId": m.message_id.to_string(), "deletedBy": "bob" }),
            t0,
        );
        match LogEntry::from_row(tomb) {
            Some(LogEntry::Delete { target, deleted_by }) => {
                assert_eq!(target, m.message_id);
                assert_eq!(deleted_by, UserId::from("bob"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn days_follow_the_viewer_offset() {
        // 23:30 UTC and 00:30 UTC the next day.
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 23, 30, 0).unwrap();
        let early = late + Duration::hours(1);
        let items = vec![late, early];

        let utc = group_by_day(items.clone(), viewer_offset(None), |t| *t);
        assert_eq!(utc.len(), 2);

        // UTC+07:00 puts both on May 2nd.
        let plus_seven = group_by_day(items, viewer_offset(Some(7 * 60)), |t| *t);
        assert_eq!(plus_seven.len(), 1);
        assert_eq!(plus_seven[0].date, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_eq!(plus_seven[0].messages.len(), 2);
    }
}
