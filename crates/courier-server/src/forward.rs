//! Copying an existing message into another conversation or group.

use chrono::Utc;
use serde_json::json;
use tracing::info;

use courier_shared::protocol::{ForwardedMessage, MessagePayload, ServerEvent};
use courier_shared::types::{
    ConversationId, GroupEntryKind, GroupId, MessageId, MessageKind, MessageStatus, UserId,
};
use courier_store::{DirectMessage, GroupLogRow};

use crate::chat::ChatService;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::groups::GroupEngine;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardSource {
    Group(GroupId),
    /// The conversation between the forwarding user and `peer`.
    Conversation { peer: UserId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    Group(GroupId),
    Direct(UserId),
}

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub message_id: MessageId,
    pub source: ForwardSource,
    pub target: ForwardTarget,
}

/// What gets copied out of the source message.
struct Original {
    content: String,
    file_type: Option<String>,
    is_file: bool,
    is_system: bool,
    sender: UserId,
    provenance: serde_json::Value,
}

#[derive(Clone)]
pub struct ForwardService {
    store: Store,
    chat: ChatService,
    groups: GroupEngine,
    dispatcher: Dispatcher,
}

impl ForwardService {
    pub fn new(store: Store, chat: ChatService, groups: GroupEngine, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            chat,
            groups,
            dispatcher,
        }
    }

    pub async fn forward(
        &self,
        sender: &UserId,
        req: ForwardRequest,
    ) -> Result<ForwardedMessage, ServerError> {
        let original = self.load_original(sender, &req)?;

        let forwarded = match &req.target {
            ForwardTarget::Group(group) => {
                self.groups.membership().require_active(group, sender)?;
                let kind = if original.is_system {
                    GroupEntryKind::System
                } else if original.is_file {
                    GroupEntryKind::File
                } else {
                    GroupEntryKind::Text
                };
                let mut row = GroupLogRow::base(
                    group,
                    sender,
                    original.content,
                    kind,
                    original.file_type,
                    Utc::now(),
                );
                row.metadata = original.provenance;
                ForwardedMessage::Group(self.groups.append(row).await?)
            }
            ForwardTarget::Direct(receiver) => {
                if receiver.is_empty() {
                    return Err(ServerError::invalid("targetId is required"));
                }
                if receiver == sender {
                    return Err(ServerError::invalid("cannot forward a message to yourself"));
                }
                let kind = if original.is_system {
                    MessageKind::System
                } else if original.is_file {
                    MessageKind::File
                } else {
                    MessageKind::Text
                };
                let mut message = DirectMessage::new(
                    sender,
                    receiver,
                    original.content,
                    kind,
                    original.file_type,
                    Utc::now(),
                );
                message.metadata = original.provenance;
                let message = self.chat.deliver(message).await?;
                ForwardedMessage::Conversation(MessagePayload::from(&message))
            }
        };

        self.dispatcher
            .push(
                sender,
                ServerEvent::MessageForwarded {
                    message: forwarded.clone(),
                },
            )
            .await;

        info!(
            source = %req.message_id,
            original_sender = %original.sender,
            target = ?req.target,
            "Message forwarded"
        );
        Ok(forwarded)
    }

    fn load_original(&self, sender: &UserId, req: &ForwardRequest) -> Result<Original, ServerError> {
        match &req.source {
            ForwardSource::Group(group) => {
                self.groups.membership().require_active(group, sender)?;
                let row = self.groups.load(group, &req.message_id)?;
                if row.status == MessageStatus::Recalled {
                    return Err(ServerError::invalid("a recalled message cannot be forwarded"));
                }
                Ok(Original {
                    is_file: row.kind == GroupEntryKind::File,
                    is_system: row.kind == GroupEntryKind::System,
                    provenance: json!({
                        "forwardedFrom": "group",
                        "originalMessageId": row.message_id.to_string(),
                        "originalSender": row.sender_id,
                        "originalGroupId": group,
                    }),
                    content: row.content,
                    file_type: row.file_type,
                    sender: row.sender_id,
                })
            }
            ForwardSource::Conversation { peer } => {
                let conversation_id = ConversationId::between(sender, peer);
                let message = self
                    .store
                    .run(|db| db.get_conversation_message(&conversation_id, &req.message_id))
                    .map_err(|e| match e {
                        ServerError::NotFound(_) => ServerError::not_found("message not found"),
                        other => other,
                    })?;
                match message.status {
                    MessageStatus::Recalled => {
                        return Err(ServerError::invalid("a recalled message cannot be forwarded"))
                    }
                    MessageStatus::Deleted => {
                        return Err(ServerError::invalid("a deleted message cannot be forwarded"))
                    }
                    _ => {}
                }
                if message.kind == MessageKind::Call {
                    return Err(ServerError::invalid("call records cannot be forwarded"));
                }
                Ok(Original {
                    is_file: message.kind == MessageKind::File,
                    is_system: message.kind == MessageKind::System,
                    provenance: json!({
                        "forwardedFrom": "conversation",
                        "originalMessageId": message.message_id.to_string(),
                        "originalSender": message.sender_id,
                        "originalConversationId": conversation_id,
                    }),
                    content: message.content,
                    file_type: message.file_type,
                    sender: message.sender_id,
                })
            }
        }
    }
}
