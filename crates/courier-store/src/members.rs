use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::types::{GroupId, UserId};

use crate::codec::{encode_opt_ts, encode_ts, opt_ts_at, ts_at};
use crate::database::Database;
use crate::error::Result;
use crate::models::GroupMember;

impl Database {
    /// Insert or replace a membership row. Membership is owned by an external
    /// service; this is how it gets mirrored (and seeded in tests).
    pub fn upsert_group_member(&self, member: &GroupMember) -> Result<()> {
        self.conn().execute(
            "INSERT INTO group_members (group_id, user_id, role, is_active, joined_at, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(group_id, user_id) DO UPDATE SET
                 role      = excluded.role,
                 is_active = excluded.is_active",
            params![
                member.group_id.as_str(),
                member.user_id.as_str(),
                member.role,
                member.is_active,
                encode_ts(&member.joined_at),
                encode_opt_ts(member.last_read_at.as_ref()),
            ],
        )?;
        Ok(())
    }

    pub fn get_group_member(&self, group: &GroupId, user: &UserId) -> Result<Option<GroupMember>> {
        let member = self
            .conn()
            .query_row(
                "SELECT group_id, user_id, role, is_active, joined_at, last_read_at
                 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group.as_str(), user.as_str()],
                row_to_member,
            )
            .optional()?;
        Ok(member)
    }

    pub fn is_active_group_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        Ok(self
            .get_group_member(group, user)?
            .map(|m| m.is_active)
            .unwrap_or(false))
    }

    pub fn active_group_members(&self, group: &GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM group_members
             WHERE group_id = ?1 AND is_active = 1
             ORDER BY joined_at ASC",
        )?;
        let rows = stmt.query_map(params![group.as_str()], |row| {
            row.get::<_, String>(0).map(UserId)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Returns whether the membership row existed.
    pub fn set_group_last_read(
        &self,
        group: &GroupId,
        user: &UserId,
        at: &DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE group_members SET last_read_at = ?3 WHERE group_id = ?1 AND user_id = ?2",
            params![group.as_str(), user.as_str(), encode_ts(at)],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMember> {
    let group_id: String = row.get(0)?;
    let user_id: String = row.get(1)?;

    Ok(GroupMember {
        group_id: GroupId(group_id),
        user_id: UserId(user_id),
        role: row.get(2)?,
        is_active: row.get(3)?,
        joined_at: ts_at(row, 4)?,
        last_read_at: opt_ts_at(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(group: &str, user: &str, active: bool) -> GroupMember {
        GroupMember {
            group_id: GroupId::from(group),
            user_id: UserId::from(user),
            role: "member".into(),
            is_active: active,
            joined_at: Utc::now(),
            last_read_at: None,
        }
    }

    #[test]
    fn inactive_members_are_not_active() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_group_member(&member("g1", "alice", true)).unwrap();
        db.upsert_group_member(&member("g1", "bob", false)).unwrap();

        let g1 = GroupId::from("g1");
        assert!(db.is_active_group_member(&g1, &UserId::from("alice")).unwrap());
        assert!(!db.is_active_group_member(&g1, &UserId::from("bob")).unwrap());
        assert!(!db.is_active_group_member(&g1, &UserId::from("carol")).unwrap());
        assert_eq!(db.active_group_members(&g1).unwrap(), vec![UserId::from("alice")]);
    }

    #[test]
    fn last_read_survives_membership_refresh() {
        let db = Database::open_in_memory().unwrap();
        let g1 = GroupId::from("g1");
        let alice = UserId::from("alice");
        db.upsert_group_member(&member("g1", "alice", true)).unwrap();

        let at = Utc::now();
        assert!(db.set_group_last_read(&g1, &alice, &at).unwrap());
        db.upsert_group_member(&member("g1", "alice", true)).unwrap();

        let stored = db.get_group_member(&g1, &alice).unwrap().unwrap();
        assert_eq!(
            stored.last_read_at.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
    }
}
