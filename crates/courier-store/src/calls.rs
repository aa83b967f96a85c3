use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

use courier_shared::types::{CallId, CallStatus, UserId};

use crate::codec::{encode_opt_ts, encode_ts, opt_ts_at, parsed_at, ts_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{CallRecord, CallTransition};

const SELECT_COLUMNS: &str = "call_id, caller_id, callee_id, call_kind, room_name,
     max_participants, status, created_at, started_at, ended_at, duration_secs,
     last_activity_at, ended_by, updated_at";

impl Database {
    pub fn insert_call(&self, call: &CallRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO calls ({SELECT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                call.call_id.to_string(),
                call.caller_id.as_str(),
                call.callee_id.as_str(),
                call.call_kind.as_str(),
                call.room_name,
                call.max_participants,
                call.status.as_str(),
                encode_ts(&call.created_at),
                encode_opt_ts(call.started_at.as_ref()),
                encode_opt_ts(call.ended_at.as_ref()),
                call.duration_secs,
                encode_ts(&call.last_activity_at),
                call.ended_by.as_ref().map(|u| u.as_str()),
                encode_ts(&call.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_call(&self, id: &CallId) -> Result<CallRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM calls WHERE call_id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(StoreError::from_query)
    }

    /// Apply `transition` only if the call is currently in one of
    /// `transition.from`. Returns whether this caller won the transition.
    pub fn transition_call(&self, id: &CallId, transition: &CallTransition) -> Result<bool> {
        if transition.from.is_empty() {
            return Ok(false);
        }

        let placeholders = (0..transition.from.len())
            .map(|i| format!("?{}", i + 8))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE calls SET
                 status           = ?2,
                 updated_at       = ?3,
                 last_activity_at = ?3,
                 started_at       = COALESCE(?4, started_at),
                 ended_at         = COALESCE(?5, ended_at),
                 duration_secs    = COALESCE(?6, duration_secs),
                 ended_by         = COALESCE(?7, ended_by)
             WHERE call_id = ?1 AND status IN ({placeholders})"
        );

        let mut values = vec![
            Value::Text(id.to_string()),
            Value::Text(transition.to.as_str().to_string()),
            Value::Text(encode_ts(&transition.at)),
            opt_value(encode_opt_ts(transition.started_at.as_ref())),
            opt_value(encode_opt_ts(transition.ended_at.as_ref())),
            transition.duration_secs.map(Value::Integer).unwrap_or(Value::Null),
            opt_value(transition.ended_by.as_ref().map(|u| u.0.clone())),
        ];
        values.extend(
            transition
                .from
                .iter()
                .map(|s| Value::Text(s.as_str().to_string())),
        );

        let affected = self.conn().execute(&sql, params_from_iter(values))?;
        Ok(affected > 0)
    }

    /// Calls `user` took part in, newest first, created strictly before
    /// `before` when given.
    pub fn calls_for_user(
        &self,
        user: &UserId,
        before: Option<&DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM calls
             WHERE (caller_id = ?1 OR callee_id = ?1)
               AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![user.as_str(), encode_opt_ts(before), i64::from(limit)],
            row_to_call,
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn calls_with_status(&self, status: CallStatus) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM calls WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_call)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn opt_value(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let caller_id: String = row.get(1)?;
    let callee_id: String = row.get(2)?;

    Ok(CallRecord {
        call_id: parsed_at(row, 0)?,
        caller_id: UserId(caller_id),
        callee_id: UserId(callee_id),
        call_kind: parsed_at(row, 3)?,
        room_name: row.get(4)?,
        max_participants: row.get(5)?,
        status: parsed_at(row, 6)?,
        created_at: ts_at(row, 7)?,
        started_at: opt_ts_at(row, 8)?,
        ended_at: opt_ts_at(row, 9)?,
        duration_secs: row.get(10)?,
        last_activity_at: ts_at(row, 11)?,
        ended_by: row.get::<_, Option<String>>(12)?.map(UserId),
        updated_at: ts_at(row, 13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_shared::types::CallKind;

    fn ringing_call(now: DateTime<Utc>) -> CallRecord {
        CallRecord {
            call_id: CallId::new(),
            caller_id: UserId::from("alice"),
            callee_id: UserId::from("bob"),
            call_kind: CallKind::Video,
            room_name: "room-1".into(),
            max_participants: 2,
            status: CallStatus::Ringing,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            last_activity_at: now,
            ended_by: None,
            updated_at: now,
        }
    }

    #[test]
    fn only_one_transition_out_of_ringing_wins() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let call = ringing_call(now);
        db.insert_call(&call).unwrap();

        let mut accept = CallTransition::new(CallStatus::Accepted, &[CallStatus::Ringing], now);
        accept.started_at = Some(now);
        let mut missed = CallTransition::new(CallStatus::Missed, &[CallStatus::Ringing], now);
        missed.ended_at = Some(now);

        assert!(db.transition_call(&call.call_id, &accept).unwrap());
        assert!(!db.transition_call(&call.call_id, &missed).unwrap());

        let stored = db.get_call(&call.call_id).unwrap();
        assert_eq!(stored.status, CallStatus::Accepted);
        assert!(stored.started_at.is_some());
        assert!(stored.ended_at.is_none());
    }

    #[test]
    fn end_records_duration_and_ender() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let call = ringing_call(now);
        db.insert_call(&call).unwrap();

        let mut end = CallTransition::new(
            CallStatus::Ended,
            &[CallStatus::Ringing, CallStatus::Accepted],
            now + Duration::seconds(5),
        );
        end.ended_at = Some(end.at);
        end.duration_secs = Some(5);
        end.ended_by = Some(UserId::from("bob"));
        assert!(db.transition_call(&call.call_id, &end).unwrap());

        let stored = db.get_call(&call.call_id).unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(stored.duration_secs, Some(5));
        assert_eq!(stored.ended_by, Some(UserId::from("bob")));
        assert_eq!(db.calls_with_status(CallStatus::Ringing).unwrap().len(), 0);
    }

    #[test]
    fn history_is_newest_first_for_both_sides() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        let first = ringing_call(t0);
        let second = ringing_call(t0 + Duration::seconds(1));
        db.insert_call(&first).unwrap();
        db.insert_call(&second).unwrap();

        let bob = db.calls_for_user(&UserId::from("bob"), None, 10).unwrap();
        assert_eq!(bob.len(), 2);
        assert_eq!(bob[0].call_id, second.call_id);

        let older = db
            .calls_for_user(&UserId::from("alice"), Some(&second.created_at), 10)
            .unwrap();
        assert_eq!(older.len(), 1);
        assert!(matches!(db.get_call(&CallId::new()), Err(StoreError::NotFound)));
    }
}
