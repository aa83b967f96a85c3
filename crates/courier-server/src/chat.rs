//! Direct (two-party) message operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use courier_shared::constants::{
    DEFAULT_HISTORY_PAGE, DELETE_PLACEHOLDER, MAX_MESSAGE_CHARS, MAX_PAGE_SIZE, RECALL_PLACEHOLDER,
};
use courier_shared::protocol::{MessagePayload, ServerEvent};
use courier_shared::types::{ConversationId, MessageId, MessageKind, MessageStatus, UserId};
use courier_store::{preview_text, DirectMessage, LastMessage, PageQuery};

use crate::conversations::{ConversationService, UnreadEffect};
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::overlay::{group_by_day, viewer_offset, DayGroup};
use crate::store::Store;

/// Validated body of a text or file message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBody {
    pub content: String,
    pub file_type: Option<String>,
    pub is_file: bool,
}

impl MessageBody {
    /// A file URL wins over text content. Text must be non-blank and at most
    /// `MAX_MESSAGE_CHARS` characters.
    pub fn parse(
        content: Option<&str>,
        file_url: Option<&str>,
        file_type: Option<&str>,
    ) -> Result<Self, ServerError> {
        if let Some(url) = file_url.map(str::trim).filter(|u| !u.is_empty()) {
            return Ok(Self {
                content: url.to_string(),
                file_type: file_type.map(str::to_string),
                is_file: true,
            });
        }

        let text = content.map(str::trim).unwrap_or_default();
        if text.is_empty() {
            return Err(ServerError::invalid("message content or file is required"));
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ServerError::invalid(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
        Ok(Self {
            content: text.to_string(),
            file_type: None,
            is_file: false,
        })
    }

    pub fn kind(&self) -> MessageKind {
        if self.is_file {
            MessageKind::File
        } else {
            MessageKind::Text
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDirect {
    pub receiver_id: UserId,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_type: Option<String>,
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    /// `asc` for oldest first; newest first otherwise.
    pub order: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    /// Viewer's offset from UTC in minutes, for day grouping.
    pub tz_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub conversation_id: ConversationId,
    pub days: Vec<DayGroup<MessagePayload>>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct ChatService {
    store: Store,
    conversations: ConversationService,
    dispatcher: Dispatcher,
    recall_window: chrono::Duration,
}

impl ChatService {
    pub fn new(
        store: Store,
        conversations: ConversationService,
        dispatcher: Dispatcher,
        recall_window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            conversations,
            dispatcher,
            recall_window,
        }
    }

    pub async fn send(&self, sender: &UserId, req: SendDirect) -> Result<DirectMessage, ServerError> {
        if req.receiver_id.is_empty() {
            return Err(ServerError::invalid("receiverId is required"));
        }
        if &req.receiver_id == sender {
            return Err(ServerError::invalid("cannot send a message to yourself"));
        }

        let body = MessageBody::parse(
            req.content.as_deref(),
            req.file_url.as_deref(),
            req.file_type.as_deref(),
        )?;
        let kind = body.kind();
        let message = DirectMessage::new(
            sender,
            &req.receiver_id,
            body.content,
            kind,
            body.file_type,
            Utc::now(),
        );

        let message = self.deliver(message).await?;

        self.dispatcher
            .push(
                sender,
                ServerEvent::MessageSent {
                    message_id: message.message_id,
                    temp_id: req.temp_id,
                    timestamp: message.timestamp,
                    status: message.status,
                },
            )
            .await;

        info!(
            message = %message.message_id,
            conversation = %message.conversation_id,
            kind = %message.kind,
            "Direct message sent"
        );
        Ok(message)
    }

    /// Persist a new message, refresh both conversation rows and notify the
    /// receiver. Shared by plain sends and forwards.
    pub(crate) async fn deliver(&self, message: DirectMessage) -> Result<DirectMessage, ServerError> {
        self.store.run(|db| db.insert_message(&message))?;

        let row = self.conversations.upsert(
            &message.sender_id,
            &message.receiver_id,
            last_message_of(&message, PreviewOf::Sent, message.timestamp),
            UnreadEffect::NewMessage,
        )?;

        let mut payload = MessagePayload::from(&message);
        payload.status = MessageStatus::Delivered;
        self.dispatcher
            .push(&message.receiver_id, ServerEvent::NewMessage(payload))
            .await;

        let preview = ServerEvent::ConversationUpdated(row.preview());
        self.dispatcher
            .push_many([&message.sender_id, &message.receiver_id], &preview)
            .await;

        Ok(message)
    }

    pub async fn recall(
        &self,
        user: &UserId,
        message_id: MessageId,
        peer: &UserId,
    ) -> Result<DirectMessage, ServerError> {
        self.recall_at(user, message_id, peer, Utc::now()).await
    }

    pub(crate) async fn recall_at(
        &self,
        user: &UserId,
        message_id: MessageId,
        peer: &UserId,
        now: DateTime<Utc>,
    ) -> Result<DirectMessage, ServerError> {
        let conversation_id = ConversationId::between(user, peer);
        let mut message = self
            .store
            .run(|db| db.get_conversation_message(&conversation_id, &message_id))
            .map_err(|e| match e {
                ServerError::NotFound(_) => ServerError::not_found("message not found"),
                other => other,
            })?;

        if &message.sender_id != user {
            return Err(ServerError::forbidden("only the sender can recall a message"));
        }
        match message.status {
            MessageStatus::Recalled => return Ok(message),
            MessageStatus::Deleted => {
                return Err(ServerError::invalid("a deleted message cannot be recalled"))
            }
            _ => {}
        }
        if now - message.timestamp > self.recall_window {
            return Err(ServerError::Expired(format!(
                "messages can only be recalled within {} hours",
                self.recall_window.num_hours()
            )));
        }

        self.store.run(|db| {
            db.update_message_status(&message_id, MessageStatus::Recalled, Some(RECALL_PLACEHOLDER))
        })?;
        message.status = MessageStatus::Recalled;
        message.content = RECALL_PLACEHOLDER.to_string();

        let row = self.conversations.upsert(
            user,
            peer,
            last_message_of(&message, PreviewOf::Recalled, now),
            UnreadEffect::PreviewOnly,
        )?;

        self.dispatcher
            .push(
                peer,
                ServerEvent::MessageRecalled {
                    message_id,
                    conversation_id: conversation_id.clone(),
                    content: RECALL_PLACEHOLDER.to_string(),
                    kind: message.kind,
                    file_type: message.file_type.clone(),
                },
            )
            .await;
        self.dispatcher
            .push_many([user, peer], &ServerEvent::ConversationUpdated(row.preview()))
            .await;

        info!(message = %message_id, conversation = %conversation_id, "Direct message recalled");
        Ok(message)
    }

    pub async fn delete(
        &self,
        user: &UserId,
        message_id: MessageId,
    ) -> Result<DirectMessage, ServerError> {
        let mut message = self
            .store
            .run(|db| db.get_message(&message_id))
            .map_err(|e| match e {
                ServerError::NotFound(_) => ServerError::not_found("message not found"),
                other => other,
            })?;

        if &message.sender_id != user {
            return Err(ServerError::forbidden("only the sender can delete a message"));
        }
        if message.status == MessageStatus::Deleted {
            return Ok(message);
        }

        self.store
            .run(|db| db.update_message_status(&message_id, MessageStatus::Deleted, None))?;
        message.status = MessageStatus::Deleted;

        let peer = message.peer_of(user).clone();
        let now = Utc::now();
        let row = self.conversations.upsert(
            user,
            &peer,
            last_message_of(&message, PreviewOf::Deleted, now),
            UnreadEffect::PreviewOnly,
        )?;

        self.dispatcher
            .push(
                &peer,
                ServerEvent::MessageDeleted {
                    message_id,
                    conversation_id: message.conversation_id.clone(),
                    kind: message.kind,
                    file_type: message.file_type.clone(),
                },
            )
            .await;
        self.dispatcher
            .push_many([user, &peer], &ServerEvent::ConversationUpdated(row.preview()))
            .await;

        info!(message = %message_id, "Direct message deleted");
        Ok(message)
    }

    pub fn history(
        &self,
        user: &UserId,
        peer: &UserId,
        query: &HistoryQuery,
    ) -> Result<HistoryView, ServerError> {
        if peer.is_empty() {
            return Err(ServerError::invalid("peer is required"));
        }
        if let (Some(after), Some(before)) = (query.after, query.before) {
            if after >= before {
                return Err(ServerError::invalid("`after` must be earlier than `before`"));
            }
        }

        let conversation_id = ConversationId::between(user, peer);
        let ascending = query
            .order
            .as_deref()
            .map(|o| o.eq_ignore_ascii_case("asc"))
            .unwrap_or(false);
        let page_query = PageQuery {
            limit: query
                .limit
                .unwrap_or(DEFAULT_HISTORY_PAGE)
                .clamp(1, MAX_PAGE_SIZE),
            ascending,
            since: query.after,
            until: query.before,
            after_key: None,
        };

        let page = self
            .store
            .run(|db| db.list_conversation_messages(&conversation_id, &page_query))?;

        let oldest = page.items.iter().map(|m| m.timestamp).min();
        let newest = page.items.iter().map(|m| m.timestamp).max();
        let payloads: Vec<MessagePayload> = page
            .items
            .iter()
            .map(|m| {
                let mut payload = MessagePayload::from(m);
                if m.status == MessageStatus::Deleted {
                    payload.content = DELETE_PLACEHOLDER.to_string();
                }
                payload
            })
            .collect();

        Ok(HistoryView {
            conversation_id,
            days: group_by_day(payloads, viewer_offset(query.tz_offset_minutes), |m| {
                m.timestamp
            }),
            oldest,
            newest,
            has_more: page.has_more,
        })
    }
}

/// What happened to the message a preview is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreviewOf {
    Sent,
    Recalled,
    Deleted,
}

/// Conversation preview for `message` after `what` happened to it.
fn last_message_of(message: &DirectMessage, what: PreviewOf, at: DateTime<Utc>) -> LastMessage {
    let is_file = message.kind == MessageKind::File;
    let file = || preview_text(&message.content, message.file_type.as_deref(), true);
    let content = match (what, is_file) {
        (PreviewOf::Sent, _) => preview_text(&message.content, message.file_type.as_deref(), is_file),
        (PreviewOf::Recalled, true) => format!("{} recalled", file()),
        (PreviewOf::Deleted, true) => format!("{} deleted", file()),
        (PreviewOf::Recalled, false) => RECALL_PLACEHOLDER.to_string(),
        (PreviewOf::Deleted, false) => DELETE_PLACEHOLDER.to_string(),
    };
    LastMessage {
        content,
        sender_id: message.sender_id.clone(),
        timestamp: at,
        kind: message.kind,
        file_type: message.file_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRegistry;
    use chrono::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        chat: ChatService,
        store: Store,
        sessions: SessionRegistry,
    }

    fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let sessions = SessionRegistry::new(32);
        let chat = ChatService::new(
            store.clone(),
            ConversationService::new(store.clone()),
            Dispatcher::new(sessions.clone()),
            Duration::hours(24),
        );
        Fixture {
            chat,
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

    fn text(receiver: &str, content: &str) -> SendDirect {
        SendDirect {
            receiver_id: UserId::from(receiver),
            content: Some(content.to_string()),
            file_url: None,
            file_type: None,
            temp_id: Some("tmp-1".into()),
        }
    }

    #[test]
    fn body_rules() {
        assert!(MessageBody::parse(None, None, None).is_err());
        assert!(MessageBody::parse(Some("   "), None, None).is_err());
        assert!(MessageBody::parse(Some(&"x".repeat(200)), None, None).is_ok());
        assert!(MessageBody::parse(Some(&"x".repeat(201)), None, None).is_err());

        let file = MessageBody::parse(None, Some("https://cdn/x.png"), Some("image/png")).unwrap();
        assert_eq!(file.kind(), MessageKind::File);
        assert_eq!(file.file_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn send_notifies_both_sides() {
        let f = fixture();
        let mut alice_rx = connect(&f.sessions, "alice").await;
        let mut bob_rx = connect(&f.sessions, "bob").await;
        drain(&mut alice_rx);

        let alice = UserId::from("alice");
        let message = f.chat.send(&alice, text("bob", "hello")).await.unwrap();
        assert_eq!(message.status, MessageStatus::Sent);

        let bob_events = drain(&mut bob_rx);
        assert!(bob_events.iter().any(|e| matches!(
            e,
            ServerEvent::NewMessage(p) if p.status == MessageStatus::Delivered && p.content == "hello"
        )));
        assert!(bob_events
            .iter()
            .any(|e| matches!(e, ServerEvent::ConversationUpdated(_))));

        let alice_events = drain(&mut alice_rx);
        assert!(alice_events.iter().any(|e| matches!(
            e,
            ServerEvent::MessageSent { temp_id: Some(t), .. } if t == "tmp-1"
        )));
    }

    #[tokio::test]
    async fn file_messages_preview_their_type() {
        let f = fixture();
        let alice = UserId::from("alice");
        let req = SendDirect {
            receiver_id: UserId::from("bob"),
            content: None,
            file_url: Some("https://cdn/doc.pdf".into()),
            file_type: Some("application/pdf".into()),
            temp_id: None,
        };
        f.chat.send(&alice, req).await.unwrap();

        let list = ConversationService::new(f.store.clone())
            .list_for_user(&UserId::from("bob"), None, None)
            .unwrap();
        assert_eq!(list.conversations[0].last_message.content, "[File] application/pdf");
    }

    #[tokio::test]
    async fn withdrawn_file_previews_keep_their_type() {
        let f = fixture();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let image = |url: &str| SendDirect {
            receiver_id: bob.clone(),
            content: None,
            file_url: Some(url.into()),
            file_type: Some("image/png".into()),
            temp_id: None,
        };
        let bob_preview = || {
            ConversationService::new(f.store.clone())
                .list_for_user(&bob, None, None)
                .unwrap()
                .conversations[0]
                .last_message
                .content
                .clone()
        };

        let first = f.chat.send(&alice, image("https://cdn/a.png")).await.unwrap();
        f.chat.recall(&alice, first.message_id, &bob).await.unwrap();
        assert_eq!(bob_preview(), "[File] image/png recalled");

        let second = f.chat.send(&alice, image("https://cdn/b.png")).await.unwrap();
        f.chat.delete(&alice, second.message_id).await.unwrap();
        assert_eq!(bob_preview(), "[File] image/png deleted");

        let third = f.chat.send(&alice, text("bob", "hi")).await.unwrap();
        f.chat.recall(&alice, third.message_id, &bob).await.unwrap();
        assert_eq!(bob_preview(), RECALL_PLACEHOLDER);
    }

    #[tokio::test]
    async fn self_messages_are_rejected() {
        let f = fixture();
        let err = f
            .chat
            .send(&UserId::from("alice"), text("alice", "me"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Invalid(_)));
    }

    #[tokio::test]
    async fn recall_window_is_inclusive() {
        let f = fixture();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let sent = f.chat.send(&alice, text("bob", "oops")).await.unwrap();

        let late = sent.timestamp + Duration::hours(24) + Duration::seconds(1);
        let err = f
            .chat
            .recall_at(&alice, sent.message_id, &bob, late)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Expired(_)));

        let err = f
            .chat
            .recall_at(&bob, sent.message_id, &alice, sent.timestamp)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));

        let on_the_edge = sent.timestamp + Duration::hours(24);
        let recalled = f
            .chat
            .recall_at(&alice, sent.message_id, &bob, on_the_edge)
            .await
            .unwrap();
        assert_eq!(recalled.content, RECALL_PLACEHOLDER);

        let stored = f.store.run(|db| db.get_message(&sent.message_id)).unwrap();
        assert_eq!(stored.status, MessageStatus::Recalled);
    }

    #[tokio::test]
    async fn recall_of_unknown_message_is_not_found() {
        let f = fixture();
        let err = f
            .chat
            .recall(&UserId::from("alice"), MessageId::new(), &UserId::from("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_sender_only_and_notifies_peer() {
        let f = fixture();
        let mut bob_rx = connect(&f.sessions, "bob").await;
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let sent = f.chat.send(&alice, text("bob", "bye")).await.unwrap();
        drain(&mut bob_rx);

        assert!(matches!(
            f.chat.delete(&bob, sent.message_id).await,
            Err(ServerError::Forbidden(_))
        ));

        let deleted = f.chat.delete(&alice, sent.message_id).await.unwrap();
        assert_eq!(deleted.status, MessageStatus::Deleted);
        assert!(drain(&mut bob_rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageDeleted { .. })));
    }

    #[tokio::test]
    async fn history_groups_by_day_and_pages() {
        let f = fixture();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        for i in 0..3 {
            f.chat
                .send(&alice, text("bob", &format!("m{i}")))
                .await
                .unwrap();
        }

        let view = f
            .chat
            .history(
                &bob,
                &alice,
                &HistoryQuery {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(view.has_more);
        let total: usize = view.days.iter().map(|d| d.messages.len()).sum();
        assert_eq!(total, 2);
        assert!(view.oldest <= view.newest);
    }
}
