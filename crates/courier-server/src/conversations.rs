//! Two-party conversation threading.
//!
//! Every conversation is stored as two rows, one per participant, so each
//! side can list its own chats with a single indexed read. The rows are
//! written one after the other without a transaction; a failure between the
//! writes leaves the second participant's preview stale until the next
//! successful upsert.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use courier_shared::constants::{DEFAULT_CONVERSATION_PAGE, MAX_PAGE_SIZE};
use courier_shared::types::{ConversationId, MessageKind, UserId};
use courier_store::{stored_precision, ConversationRow, LastMessage, UnreadUpdate};

use crate::error::ServerError;
use crate::store::Store;

/// How an upsert treats the unread counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadEffect {
    /// A new message: the receiver gains one unread, the sender reads up.
    NewMessage,
    /// A preview rewrite (recall, delete): counters are left alone.
    PreviewOnly,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageView {
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub file_type: Option<String>,
    pub is_from_me: bool,
}

/// A conversation as seen by one participant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub last_message: LastMessageView,
    pub unread_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct ConversationService {
    store: Store,
}

impl ConversationService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Write both participants' rows with the same last message. Returns the
    /// sender's row.
    pub fn upsert(
        &self,
        sender: &UserId,
        receiver: &UserId,
        last_message: LastMessage,
        effect: UnreadEffect,
    ) -> Result<ConversationRow, ServerError> {
        if sender.is_empty() || receiver.is_empty() {
            return Err(ServerError::invalid("sender and receiver are required"));
        }

        let conversation_id = ConversationId::between(sender, receiver);
        let now = stored_precision(Utc::now());
        let created_at = self
            .store
            .run(|db| db.conversation_created_at(&conversation_id))?
            .unwrap_or(now);

        let row_for = |owner: &UserId, other: &UserId| ConversationRow {
            conversation_id: conversation_id.clone(),
            participant_id: owner.clone(),
            other_participant_id: other.clone(),
            last_message: last_message.clone(),
            unread_count: 0,
            created_at,
            updated_at: now,
        };

        let (sender_unread, receiver_unread) = match effect {
            UnreadEffect::NewMessage => (UnreadUpdate::Reset, UnreadUpdate::Increment),
            UnreadEffect::PreviewOnly => (UnreadUpdate::Keep, UnreadUpdate::Keep),
        };

        let sender_row = row_for(sender, receiver);
        self.store
            .run(|db| db.put_conversation_row(&sender_row, sender_unread))?;

        // A self-conversation has a single row.
        if sender != receiver {
            let receiver_row = row_for(receiver, sender);
            self.store
                .run(|db| db.put_conversation_row(&receiver_row, receiver_unread))?;
        }

        debug!(conversation = %conversation_id, "Conversation upserted");
        Ok(sender_row)
    }

    pub fn list_for_user(
        &self,
        user: &UserId,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<ConversationList, ServerError> {
        let limit = limit
            .unwrap_or(DEFAULT_CONVERSATION_PAGE)
            .clamp(1, MAX_PAGE_SIZE);
        let cursor = cursor.map(Cursor::parse).transpose()?;
        let after = cursor
            .as_ref()
            .map(|c| (&c.updated_at, &c.conversation_id));

        let page = self
            .store
            .run(|db| db.conversation_page_for_user(user, after, limit))?;
        let has_more = page.has_more;
        let summaries: Vec<ConversationSummary> = page
            .items
            .into_iter()
            .map(|row| project(row, user))
            .collect();
        let next_cursor = if has_more {
            summaries.last().map(|s| Cursor::of(s).encode())
        } else {
            None
        };

        Ok(ConversationList {
            conversations: summaries,
            next_cursor,
            has_more,
        })
    }

    /// Zero the caller's unread counter for the conversation with `peer`.
    pub fn mark_read(&self, user: &UserId, peer: &UserId) -> Result<bool, ServerError> {
        let conversation_id = ConversationId::between(user, peer);
        self.store
            .run(|db| db.reset_conversation_unread(&conversation_id, user))
    }
}

fn project(row: ConversationRow, viewer: &UserId) -> ConversationSummary {
    let owned = &row.participant_id == viewer;
    let peer_id = if owned {
        row.other_participant_id
    } else {
        row.participant_id
    };
    let is_from_me = &row.last_message.sender_id == viewer;

    ConversationSummary {
        conversation_id: row.conversation_id,
        peer_id,
        last_message: LastMessageView {
            content: row.last_message.content,
            sender_id: row.last_message.sender_id,
            timestamp: row.last_message.timestamp,
            kind: row.last_message.kind,
            file_type: row.last_message.file_type,
            is_from_me,
        },
        // The peer's row counts the peer's unread messages, not ours.
        unread_count: if owned { row.unread_count } else { 0 },
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

/// `updated_at|conversation_id` of the last entry of a page.
struct Cursor {
    updated_at: DateTime<Utc>,
    conversation_id: ConversationId,
}

impl Cursor {
    fn of(summary: &ConversationSummary) -> Self {
        Self {
            updated_at: summary.updated_at,
            conversation_id: summary.conversation_id.clone(),
        }
    }

    fn parse(raw: &str) -> Result<Self, ServerError> {
        let (ts, id) = raw
            .split_once('|')
            .ok_or_else(|| ServerError::invalid("malformed cursor"))?;
        let updated_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| ServerError::invalid("malformed cursor timestamp"))?
            .with_timezone(&Utc);
        Ok(Self {
            updated_at,
            conversation_id: ConversationId(id.to_string()),
        })
    }

    fn encode(&self) -> String {
        format!(
            "{}|{}",
            self.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.conversation_id
        )
    }
}
