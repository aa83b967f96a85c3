//! Group messaging over the append-only log.
//!
//! Sends append a base row. A recall flips the base row and also appends a
//! `recall_record`; a delete only appends a `delete_record`, because it hides
//! the message from the deleting member alone. Reads merge both through
//! [`crate::overlay::reduce`].

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use courier_shared::constants::{DEFAULT_HISTORY_PAGE, MAX_PAGE_SIZE, RECALL_PLACEHOLDER};
use courier_shared::protocol::{GroupMessagePayload, ServerEvent};
use courier_shared::types::{GroupEntryKind, GroupId, MessageId, MessageStatus, UserId};
use courier_store::{GroupLogRow, PageQuery};

use crate::chat::MessageBody;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::membership::MembershipLookup;
use crate::overlay::{group_by_day, reduce, viewer_offset, DayGroup, LogEntry};
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroup {
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_type: Option<String>,
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListQuery {
    pub limit: Option<u32>,
    pub order: Option<String>,
    /// Restrict the page to one calendar day in the viewer's timezone.
    pub date: Option<NaiveDate>,
    pub tz_offset_minutes: Option<i32>,
    /// `created_at|message_id` of the last base row already seen.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessagesView {
    pub group_id: GroupId,
    pub days: Vec<DayGroup<GroupMessagePayload>>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl GroupMessagesView {
    pub fn messages(&self) -> impl Iterator<Item = &GroupMessagePayload> {
        self.days.iter().flat_map(|d| d.messages.iter())
    }
}

#[derive(Clone)]
pub struct GroupEngine {
    store: Store,
    membership: Arc<dyn MembershipLookup>,
    dispatcher: Dispatcher,
    recall_window: Duration,
}

impl GroupEngine {
    pub fn new(
        store: Store,
        membership: Arc<dyn MembershipLookup>,
        dispatcher: Dispatcher,
        recall_window: Duration,
    ) -> Self {
        Self {
            store,
            membership,
            dispatcher,
            recall_window,
        }
    }

    pub fn membership(&self) -> &dyn MembershipLookup {
        self.membership.as_ref()
    }

    pub async fn send_message(
        &self,
        group: &GroupId,
        sender: &UserId,
        req: SendGroup,
    ) -> Result<GroupMessagePayload, ServerError> {
        self.membership.require_active(group, sender)?;
        let body = MessageBody::parse(
            req.content.as_deref(),
            req.file_url.as_deref(),
            req.file_type.as_deref(),
        )?;
        let kind = if body.is_file {
            GroupEntryKind::File
        } else {
            GroupEntryKind::Text
        };
        let row = GroupLogRow::base(group, sender, body.content, kind, body.file_type, Utc::now());
        let payload = self.append(row).await?;

        self.dispatcher
            .push(
                sender,
                ServerEvent::MessageSent {
                    message_id: payload.message_id,
                    temp_id: req.temp_id,
                    timestamp: payload.created_at,
                    status: payload.status,
                },
            )
            .await;

        info!(group = %group, message = %payload.message_id, "Group message sent");
        Ok(payload)
    }

    /// Append a base row and fan it out to the group's members.
    pub(crate) async fn append(&self, row: GroupLogRow) -> Result<GroupMessagePayload, ServerError> {
        self.store.run(|db| db.insert_group_entry(&row))?;

        let payload = GroupMessagePayload::from(&row);
        let members = self.membership.members(&row.group_id)?;
        self.dispatcher
            .push_many(&members, &ServerEvent::NewGroupMessage(payload.clone()))
            .await;
        self.dispatcher
            .push_many(&members, &ServerEvent::ConversationUpdated(row.preview()))
            .await;
        Ok(payload)
    }

    pub async fn recall_message(
        &self,
        group: &GroupId,
        message_id: MessageId,
        user: &UserId,
    ) -> Result<GroupMessagePayload, ServerError> {
        self.recall_at(group, message_id, user, Utc::now()).await
    }

    pub(crate) async fn recall_at(
        &self,
        group: &GroupId,
        message_id: MessageId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<GroupMessagePayload, ServerError> {
        let row = self.load(group, &message_id)?;
        if &row.sender_id != user {
            return Err(ServerError::forbidden("only the sender can recall a message"));
        }
        if row.status == MessageStatus::Recalled {
            return Ok(GroupMessagePayload::from(&row));
        }
        if now - row.created_at > self.recall_window {
            return Err(ServerError::Expired(format!(
                "messages can only be recalled within {} hours",
                self.recall_window.num_hours()
            )));
        }

        let recalled_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut metadata = match row.metadata.clone() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("recalledBy".into(), json!(user));
        metadata.insert("recalledAt".into(), json!(recalled_at));
        let metadata = serde_json::Value::Object(metadata);

        self.store.run(|db| {
            db.mark_group_message_recalled(group, &message_id, RECALL_PLACEHOLDER, &metadata, &now)
        })?;

        // The base row already carries the recall; the tombstone only keeps
        // the log complete, so a failure here does not fail the recall.
        let tombstone = GroupLogRow::tombstone(
            group,
            user,
            GroupEntryKind::RecallRecord,
            message_id,
            json!({
                "originalMessageId": message_id.to_string(),
                "recalledBy": user,
                "recalledAt": recalled_at,
            }),
            now,
        );
        if let Err(e) = self.store.run(|db| db.insert_group_entry(&tombstone)) {
            warn!(group = %group, message = %message_id, "Failed to append recall record: {e}");
        }

        let members = self.membership.members(group)?;
        self.dispatcher
            .push_many(
                &members,
                &ServerEvent::GroupMessageRecalled {
                    message_id,
                    group_id: group.clone(),
                    content: RECALL_PLACEHOLDER.to_string(),
                    recalled_by: user.clone(),
                    recalled_at: now,
                },
            )
            .await;

        info!(group = %group, message = %message_id, "Group message recalled");
        let mut updated = row;
        updated.status = MessageStatus::Recalled;
        updated.content = RECALL_PLACEHOLDER.to_string();
        updated.metadata = metadata;
        Ok(GroupMessagePayload::from(&updated))
    }

    /// Hide a message from `user`'s own view.
    pub fn delete_message(
        &self,
        group: &GroupId,
        message_id: MessageId,
        user: &UserId,
    ) -> Result<(), ServerError> {
        self.membership.require_active(group, user)?;
        self.load(group, &message_id)?;

        let tombstone = GroupLogRow::tombstone(
            group,
            user,
            GroupEntryKind::DeleteRecord,
            message_id,
            json!({
                "deletedMessageId": message_id.to_string(),
                "deletedBy": user,
            }),
            Utc::now(),
        );
        self.store.run(|db| db.insert_group_entry(&tombstone))?;
        info!(group = %group, message = %message_id, user = %user, "Group message deleted for member");
        Ok(())
    }

    pub fn list_messages(
        &self,
        group: &GroupId,
        viewer: &UserId,
        query: &GroupListQuery,
    ) -> Result<GroupMessagesView, ServerError> {
        self.membership.require_active(group, viewer)?;

        let offset = viewer_offset(query.tz_offset_minutes);
        let ascending = query
            .order
            .as_deref()
            .map(|o| o.eq_ignore_ascii_case("asc"))
            .unwrap_or(false);

        let (since, until) = match query.date {
            Some(date) => {
                let start = date
                    .and_hms_opt(0, 0, 0)
                    .and_then(|midnight| offset.from_local_datetime(&midnight).single())
                    .ok_or_else(|| ServerError::invalid("invalid date"))?
                    .with_timezone(&Utc);
                (Some(start), Some(start + Duration::days(1)))
            }
            None => (None, None),
        };
        let after_key = query.cursor.as_deref().map(parse_cursor).transpose()?;

        let page_query = PageQuery {
            limit: query
                .limit
                .unwrap_or(DEFAULT_HISTORY_PAGE)
                .clamp(1, MAX_PAGE_SIZE),
            ascending,
            since,
            until,
            after_key,
        };

        let (page, tombstones) = self.store.run(|db| {
            let page = db.list_group_base_rows(group, &page_query)?;
            let ids: Vec<MessageId> = page.items.iter().map(|r| r.message_id).collect();
            let tombstones = db.group_tombstones_for(group, &ids)?;
            Ok((page, tombstones))
        })?;

        let next_cursor = page
            .items
            .last()
            .filter(|_| page.has_more)
            .map(|row| format_cursor(row.created_at, row.message_id));
        let entries = page
            .items
            .into_iter()
            .chain(tombstones)
            .filter_map(LogEntry::from_row);
        let messages = reduce(entries, viewer, ascending);

        Ok(GroupMessagesView {
            group_id: group.clone(),
            days: group_by_day(messages, offset, |m| m.created_at),
            has_more: page.has_more,
            next_cursor,
        })
    }

    /// Replies to the joining member with the first page and their unread
    /// count, then marks the group read and tells the other members.
    pub async fn join_group(
        &self,
        group: &GroupId,
        user: &UserId,
    ) -> Result<GroupMessagesView, ServerError> {
        let unread_count = self.unread_count(group, user)?;
        let view = self.list_messages(group, user, &GroupListQuery::default())?;
        self.store
            .run(|db| db.set_group_last_read(group, user, &Utc::now()))?;

        self.dispatcher
            .push(
                user,
                ServerEvent::GroupHistory {
                    group_id: group.clone(),
                    messages: view.messages().cloned().collect(),
                    unread_count,
                },
            )
            .await;

        let others = self.others(group, user)?;
        self.dispatcher
            .push_many(
                &others,
                &ServerEvent::UserJoined {
                    user_id: user.clone(),
                    group_id: group.clone(),
                },
            )
            .await;

        info!(group = %group, user = %user, unread = unread_count, "Member joined group room");
        Ok(view)
    }

    pub async fn leave_group(&self, group: &GroupId, user: &UserId) -> Result<(), ServerError> {
        let others = self.others(group, user)?;
        self.dispatcher
            .push_many(
                &others,
                &ServerEvent::UserLeft {
                    user_id: user.clone(),
                    group_id: group.clone(),
                },
            )
            .await;
        Ok(())
    }

    pub fn mark_read(&self, group: &GroupId, user: &UserId) -> Result<(), ServerError> {
        self.membership.require_active(group, user)?;
        self.store
            .run(|db| db.set_group_last_read(group, user, &Utc::now()))?;
        Ok(())
    }

    /// Messages from other members since `user` last read the group.
    pub fn unread_count(&self, group: &GroupId, user: &UserId) -> Result<u64, ServerError> {
        let member = self
            .store
            .run(|db| db.get_group_member(group, user))?
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                ServerError::forbidden(format!("{user} is not an active member of group {group}"))
            })?;
        self.store.run(|db| {
            db.count_group_messages_since(group, user, member.last_read_at.as_ref())
        })
    }

    /// A base message of `group`. Tombstones are not addressable.
    pub(crate) fn load(&self, group: &GroupId, id: &MessageId) -> Result<GroupLogRow, ServerError> {
        let not_found = || ServerError::not_found("group message not found");
        let row = self
            .store
            .run(|db| db.get_group_message(group, id))
            .map_err(|e| match e {
                ServerError::NotFound(_) => not_found(),
                other => other,
            })?;
        if row.kind.is_tombstone() {
            return Err(not_found());
        }
        Ok(row)
    }

    fn others(&self, group: &GroupId, user: &UserId) -> Result<Vec<UserId>, ServerError> {
        Ok(self
            .membership
            .members(group)?
            .into_iter()
            .filter(|m| m != user)
            .collect())
    }
}

fn format_cursor(at: DateTime<Utc>, id: MessageId) -> String {
    format!("{}|{}", at.to_rfc3339_opts(SecondsFormat::Millis, true), id)
}

fn parse_cursor(cursor: &str) -> Result<(DateTime<Utc>, MessageId), ServerError> {
    let invalid = || ServerError::invalid("malformed cursor");
    let (ts, id) = cursor.split_once('|').ok_or_else(invalid)?;
    let ts = DateTime::parse_from_rfc3339(ts)
        .map_err(|_| invalid())?
        .with_timezone(&Utc);
    let id = id.parse().map_err(|_| invalid())?;
    Ok((ts, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::testing::add_member;
    use crate::membership::StoreMembership;
    use crate::sessions::SessionRegistry;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: GroupEngine,
        store: Store,
        sessions: SessionRegistry,
    }

    fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        for user in ["alice", "bob", "carol"] {
            add_member(&store, "g1", user, true);
        }
        add_member(&store, "g1", "dave", false);

        let sessions = SessionRegistry::new(64);
        let engine = GroupEngine::new(
            store.clone(),
            Arc::new(StoreMembership::new(store.clone())),
            Dispatcher::new(sessions.clone()),
            Duration::hours(24),
        );
        Fixture {
            engine,
            store,
            sessions,
        }
    }

    async fn connect(sessions: &SessionRegistry, user: &str) -> mpsc::Receiver<ServerEvent> {
        let (handle, rx) = sessions.open_session(UserId::from(user));
        sessions.register(handle).await;
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn text(content: &str) -> SendGroup {
        SendGroup {
            content: Some(content.into()),
            file_url: None,
            file_type: None,
            temp_id: None,
        }
    }

    fn g1() -> GroupId {
        GroupId::from("g1")
    }

    #[tokio::test]
    async fn inactive_members_cannot_send() {
        let f = fixture();
        let err = f
            .engine
            .send_message(&g1(), &UserId::from("dave"), text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));
    }

    #[tokio::test]
    async fn send_reaches_online_members() {
        let f = fixture();
        let mut bob = connect(&f.sessions, "bob").await;
        let mut dave = connect(&f.sessions, "dave").await;

        f.engine
            .send_message(&g1(), &UserId::from("alice"), text("hello"))
            .await
            .unwrap();

        assert!(drain(&mut bob)
            .iter()
            .any(|e| matches!(e, ServerEvent::NewGroupMessage(p) if p.content == "hello")));
        assert!(!drain(&mut dave)
            .iter()
            .any(|e| matches!(e, ServerEvent::NewGroupMessage(_))));
    }

    #[tokio::test]
    async fn delete_then_recall_shows_each_viewer_the_right_thing() {
        let f = fixture();
        let (alice, bob, carol) = (
            UserId::from("alice"),
            UserId::from("bob"),
            UserId::from("carol"),
        );
        let sent = f
            .engine
            .send_message(&g1(), &alice, text("secret"))
            .await
            .unwrap();

        f.engine.delete_message(&g1(), sent.message_id, &bob).unwrap();
        f.engine
            .recall_message(&g1(), sent.message_id, &alice)
            .await
            .unwrap();

        let for_bob = f
            .engine
            .list_messages(&g1(), &bob, &GroupListQuery::default())
            .unwrap();
        assert_eq!(for_bob.messages().count(), 0);

        let for_carol = f
            .engine
            .list_messages(&g1(), &carol, &GroupListQuery::default())
            .unwrap();
        let msgs: Vec<_> = for_carol.messages().collect();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, RECALL_PLACEHOLDER);
        assert_eq!(msgs[0].recalled_by, Some(alice.clone()));
    }

    #[tokio::test]
    async fn tombstones_cannot_be_targeted() {
        let f = fixture();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let sent = f
            .engine
            .send_message(&g1(), &alice, text("hi"))
            .await
            .unwrap();
        f.engine.delete_message(&g1(), sent.message_id, &bob).unwrap();

        let tombstones = f
            .store
            .run(|db| db.group_tombstones_for(&g1(), &[sent.message_id]))
            .unwrap();
        assert_eq!(tombstones.len(), 1);
        assert!(tombstones[0].kind.is_tombstone());

        let err = f
            .engine
            .delete_message(&g1(), tombstones[0].message_id, &bob)
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn recall_rules() {
        let f = fixture();
        let alice = UserId::from("alice");
        let sent = f
            .engine
            .send_message(&g1(), &alice, text("hi"))
            .await
            .unwrap();

        let err = f
            .engine
            .recall_at(&g1(), sent.message_id, &UserId::from("bob"), sent.created_at)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));

        let late = sent.created_at + Duration::hours(24) + Duration::seconds(1);
        let err = f
            .engine
            .recall_at(&g1(), sent.message_id, &alice, late)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Expired(_)));

        let err = f
            .engine
            .recall_message(&g1(), MessageId::new(), &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let edge = sent.created_at + Duration::hours(24);
        let recalled = f
            .engine
            .recall_at(&g1(), sent.message_id, &alice, edge)
            .await
            .unwrap();
        assert!(recalled.is_recalled);

        // Exactly one recall record is written.
        let tombstones = f
            .store
            .run(|db| db.group_tombstones_for(&g1(), &[sent.message_id]))
            .unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].kind, GroupEntryKind::RecallRecord);
    }

    #[tokio::test]
    async fn cursor_pages_through_the_log() {
        let f = fixture();
        let alice = UserId::from("alice");
        let t0 = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            let row = GroupLogRow::base(
                &g1(),
                &alice,
                format!("m{i}"),
                GroupEntryKind::Text,
                None,
                t0 + Duration::seconds(i),
            );
            f.store.run(|db| db.insert_group_entry(&row)).unwrap();
        }

        let query = GroupListQuery {
            limit: Some(3),
            order: Some("asc".into()),
            ..Default::default()
        };
        let first = f.engine.list_messages(&g1(), &alice, &query).unwrap();
        assert!(first.has_more);
        assert_eq!(first.messages().count(), 3);

        let second = f
            .engine
            .list_messages(
                &g1(),
                &alice,
                &GroupListQuery {
                    cursor: first.next_cursor.clone(),
                    ..query
                },
            )
            .unwrap();
        assert!(!second.has_more);
        let contents: Vec<_> = second.messages().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn join_reports_unread_then_clears_it() {
        let f = fixture();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        f.engine
            .send_message(&g1(), &alice, text("one"))
            .await
            .unwrap();
        f.engine
            .send_message(&g1(), &alice, text("two"))
            .await
            .unwrap();
        f.engine
            .send_message(&g1(), &bob, text("mine"))
            .await
            .unwrap();

        let mut bob_rx = connect(&f.sessions, "bob").await;
        let mut carol_rx = connect(&f.sessions, "carol").await;
        drain(&mut carol_rx);

        f.engine.join_group(&g1(), &bob).await.unwrap();
        assert!(drain(&mut bob_rx).iter().any(|e| matches!(
            e,
            ServerEvent::GroupHistory { unread_count: 2, messages, .. } if messages.len() == 3
        )));
        assert!(drain(&mut carol_rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::UserJoined { .. })));
        assert_eq!(f.engine.unread_count(&g1(), &bob).unwrap(), 0);
    }

    #[test]
    fn malformed_cursor_is_invalid() {
        assert!(matches!(parse_cursor("nope"), Err(ServerError::Invalid(_))));
        let id = MessageId::new();
        let now = Utc::now();
        let (ts, parsed) = parse_cursor(&format_cursor(now, id)).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(ts.timestamp_millis(), now.timestamp_millis());
    }
}
