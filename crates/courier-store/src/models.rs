//! Records persisted in the courier database.
//!
//! Conversions into the wire payloads of `courier_shared::protocol` live here
//! so that the server can hand stored rows straight to the dispatcher.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::protocol::{ConversationPreview, GroupMessagePayload, MessagePayload};
use courier_shared::types::{
    CallId, CallKind, CallMessageStatus, CallStatus, ConversationId, GroupEntryKind, GroupId,
    MessageId, MessageKind, MessageStatus, UserId,
};

/// `ts` cut to the millisecond precision timestamps are stored with, so a row
/// built in memory compares equal to the same row read back.
pub fn stored_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Snapshot of the most recent message of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub file_type: Option<String>,
}

/// One participant's projection of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: ConversationId,
    /// Owner of this row.
    pub participant_id: UserId,
    pub other_participant_id: UserId,
    pub last_message: LastMessage,
    pub unread_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a conversation upsert changes the owner's unread counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadUpdate {
    Increment,
    Reset,
    Keep,
}

impl ConversationRow {
    pub fn preview(&self) -> ConversationPreview {
        ConversationPreview {
            conversation_id: Some(self.conversation_id.clone()),
            group_id: None,
            last_message: self.last_message.content.clone(),
            timestamp: self.last_message.timestamp,
            sender: self.last_message.sender_id.clone(),
            kind: self.last_message.kind.as_str().to_string(),
            file_type: self.last_message.file_type.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Direct message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Text, or the file URL for file messages.
    pub content: String,
    pub file_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub kind: MessageKind,
    pub call_id: Option<CallId>,
    pub call_status: Option<CallMessageStatus>,
    pub duration_secs: Option<i64>,
    /// Forwarding provenance, `Null` when absent.
    pub metadata: serde_json::Value,
}

impl DirectMessage {
    /// A fresh text or file message between `sender` and `receiver`.
    pub fn new(
        sender: &UserId,
        receiver: &UserId,
        content: impl Into<String>,
        kind: MessageKind,
        file_type: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let now = stored_precision(now);
        Self {
            message_id: MessageId::new(),
            conversation_id: ConversationId::between(sender, receiver),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            content: content.into(),
            file_type,
            timestamp: now,
            status: MessageStatus::Sent,
            kind,
            call_id: None,
            call_status: None,
            duration_secs: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn peer_of(&self, user: &UserId) -> &UserId {
        if &self.sender_id == user {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

impl From<&DirectMessage> for MessagePayload {
    fn from(m: &DirectMessage) -> Self {
        MessagePayload {
            message_id: m.message_id,
            conversation_id: m.conversation_id.clone(),
            sender_id: m.sender_id.clone(),
            receiver_id: m.receiver_id.clone(),
            content: m.content.clone(),
            file_type: m.file_type.clone(),
            timestamp: m.timestamp,
            status: m.status,
            kind: m.kind,
            call_id: m.call_id,
            call_status: m.call_status,
            duration: m.duration_secs,
            metadata: m.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Group message log
// ---------------------------------------------------------------------------

/// A row of the append-only group log: a base message or a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLogRow {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub content: String,
    pub file_type: Option<String>,
    pub kind: GroupEntryKind,
    pub status: MessageStatus,
    /// Set on `recall_record` / `delete_record` rows only.
    pub target_message_id: Option<MessageId>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupLogRow {
    pub fn base(
        group: &GroupId,
        sender: &UserId,
        content: impl Into<String>,
        kind: GroupEntryKind,
        file_type: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let now = stored_precision(now);
        Self {
            message_id: MessageId::new(),
            group_id: group.clone(),
            sender_id: sender.clone(),
            content: content.into(),
            file_type,
            kind,
            status: MessageStatus::Sent,
            target_message_id: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tombstone(
        group: &GroupId,
        actor: &UserId,
        kind: GroupEntryKind,
        target: MessageId,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let now = stored_precision(now);
        Self {
            message_id: MessageId::new(),
            group_id: group.clone(),
            sender_id: actor.clone(),
            content: String::new(),
            file_type: None,
            kind,
            status: MessageStatus::Sent,
            target_message_id: Some(target),
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn preview(&self) -> ConversationPreview {
        ConversationPreview {
            conversation_id: None,
            group_id: Some(self.group_id.clone()),
            last_message: preview_text(
                &self.content,
                self.file_type.as_deref(),
                self.kind == GroupEntryKind::File,
            ),
            timestamp: self.created_at,
            sender: self.sender_id.clone(),
            kind: self.kind.as_str().to_string(),
            file_type: self.file_type.clone(),
        }
    }
}

impl From<&GroupLogRow> for GroupMessagePayload {
    fn from(row: &GroupLogRow) -> Self {
        let recalled_by = row
            .metadata
            .get("recalledBy")
            .and_then(|v| v.as_str())
            .map(UserId::from);
        let recalled_at = row
            .metadata
            .get("recalledAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        GroupMessagePayload {
            message_id: row.message_id,
            group_id: row.group_id.clone(),
            sender_id: row.sender_id.clone(),
            content: row.content.clone(),
            file_type: row.file_type.clone(),
            kind: row.kind,
            status: row.status,
            created_at: row.created_at,
            is_recalled: row.status == MessageStatus::Recalled,
            recalled_by,
            recalled_at,
            metadata: row.metadata.clone(),
        }
    }
}

/// Text used for conversation previews: file messages show their type.
pub fn preview_text(content: &str, file_type: Option<&str>, is_file: bool) -> String {
    if is_file {
        format!("[File] {}", file_type.unwrap_or("file"))
    } else {
        content.to_string()
    }
}

// ---------------------------------------------------------------------------
// Group membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role: String,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_kind: CallKind,
    pub room_name: String,
    pub max_participants: u32,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_by: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::between(&self.caller_id, &self.callee_id)
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.callee_id == user
    }

    /// The other participant, or `None` if `user` is not part of the call.
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if &self.caller_id == user {
            Some(&self.callee_id)
        } else if &self.callee_id == user {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

/// A conditional status change applied by [`crate::Database::transition_call`].
///
/// Optional fields left as `None` keep their stored value.
#[derive(Debug, Clone)]
pub struct CallTransition {
    pub to: CallStatus,
    /// Statuses the record must currently be in for the update to apply.
    pub from: Vec<CallStatus>,
    pub at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub ended_by: Option<UserId>,
}

impl CallTransition {
    pub fn new(to: CallStatus, from: &[CallStatus], at: DateTime<Utc>) -> Self {
        Self {
            to,
            from: from.to_vec(),
            at: stored_precision(at),
            started_at: None,
            ended_at: None,
            duration_secs: None,
            ended_by: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Query filters
// ---------------------------------------------------------------------------

/// Window over a time-ordered table.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub limit: u32,
    /// Oldest first instead of newest first.
    pub ascending: bool,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Keyset position of the last row of the previous page.
    pub after_key: Option<(DateTime<Utc>, MessageId)>,
}

/// A page of rows plus whether more rows exist past it.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_preview_shows_type() {
        assert_eq!(preview_text("https://x/y.png", Some("image/png"), true), "[File] image/png");
        assert_eq!(preview_text("hello", None, false), "hello");
    }

    #[test]
    fn group_payload_reads_recall_metadata() {
        let now = Utc::now();
        let mut row = GroupLogRow::base(
            &GroupId::from("g1"),
            &UserId::from("alice"),
            "hi",
            GroupEntryKind::Text,
            None,
            now,
        );
        row.status = MessageStatus::Recalled;
        row.metadata = serde_json::json!({
            "recalledBy": "alice",
            "recalledAt": "2024-01-01T00:00:00.000Z",
        });

        let payload = GroupMessagePayload::from(&row);
        assert!(payload.is_recalled);
        assert_eq!(payload.recalled_by, Some(UserId::from("alice")));
        assert!(payload.recalled_at.is_some());
    }

    #[test]
    fn built_rows_match_stored_precision() {
        let now = Utc::now();
        let m = DirectMessage::new(
            &UserId::from("a"),
            &UserId::from("b"),
            "hi",
            MessageKind::Text,
            None,
            now,
        );
        assert_eq!(m.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
        assert!(now - m.timestamp < chrono::Duration::milliseconds(1));

        let row = GroupLogRow::base(&GroupId::from("g1"), &UserId::from("a"), "hi", GroupEntryKind::Text, None, now);
        assert_eq!(row.created_at, stored_precision(now));
    }

    #[test]
    fn counterpart_of_outsider_is_none() {
        let now = Utc::now();
        let call = CallRecord {
            call_id: CallId::new(),
            caller_id: UserId::from("a"),
            callee_id: UserId::from("b"),
            call_kind: CallKind::Video,
            room_name: "room".into(),
            max_participants: 2,
            status: CallStatus::Ringing,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            last_activity_at: now,
            ended_by: None,
            updated_at: now,
        };
        assert_eq!(call.counterpart(&UserId::from("a")), Some(&UserId::from("b")));
        assert_eq!(call.counterpart(&UserId::from("c")), None);
    }
}
