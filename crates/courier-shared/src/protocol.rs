//! Events exchanged with connected clients over the real-time transport.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`. Event
//! names are kebab-case, payload fields camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{
    CallId, CallKind, CallMessageStatus, CallStatus, ConversationId, ForwardTargetKind, GroupEntryKind,
    GroupId, MessageId, MessageKind, MessageStatus, UserId,
};

/// Events a client may send after its connection passed identity checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    SendMessage {
        receiver_id: UserId,
        content: Option<String>,
        file_url: Option<String>,
        file_type: Option<String>,
        temp_id: Option<String>,
    },
    RecallMessage {
        message_id: MessageId,
        receiver_id: UserId,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    ForwardMessage {
        message_id: MessageId,
        /// The other participant of the conversation the message lives in.
        source_peer_id: UserId,
        target_id: String,
        #[serde(default = "default_forward_target")]
        target_type: ForwardTargetKind,
    },
    SendGroupMessage {
        group_id: GroupId,
        content: Option<String>,
        file_url: Option<String>,
        file_type: Option<String>,
        temp_id: Option<String>,
    },
    RecallGroupMessage {
        group_id: GroupId,
        message_id: MessageId,
    },
    DeleteGroupMessage {
        group_id: GroupId,
        message_id: MessageId,
    },
    ForwardGroupMessage {
        source_group_id: GroupId,
        source_message_id: MessageId,
        target_id: String,
        target_type: ForwardTargetKind,
    },
    Typing {
        receiver_id: UserId,
    },
    StopTyping {
        receiver_id: UserId,
    },
    CallInvite {
        receiver_id: UserId,
        room_name: Option<String>,
        #[serde(default)]
        call_type: CallKind,
    },
    CallAccept {
        call_id: CallId,
    },
    CallDecline {
        call_id: CallId,
    },
    CallEnd {
        call_id: CallId,
    },
}

fn default_forward_target() -> ForwardTargetKind {
    ForwardTargetKind::Conversation
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Correlation id echoed back on `message-sent` / `error`.
    pub fn temp_id(&self) -> Option<&str> {
        match self {
            Self::SendMessage { temp_id, .. } | Self::SendGroupMessage { temp_id, .. } => {
                temp_id.as_deref()
            }
            _ => None,
        }
    }
}

/// A direct message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub file_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_status: Option<CallMessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub metadata: serde_json::Value,
}

/// A group message after recall/delete reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessagePayload {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub content: String,
    pub file_type: Option<String>,
    #[serde(rename = "type")]
    pub kind: GroupEntryKind,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub is_recalled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recalled_by: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recalled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub metadata: serde_json::Value,
}

/// Sidebar preview pushed whenever a conversation or group gets a new last
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
    pub sender: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "targetType", rename_all = "kebab-case")]
pub enum ForwardedMessage {
    Conversation(MessagePayload),
    Group(GroupMessagePayload),
}

/// Events pushed from the server to a connected session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    NewMessage(MessagePayload),
    MessageSent {
        message_id: MessageId,
        temp_id: Option<String>,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
    },
    MessageRecalled {
        message_id: MessageId,
        conversation_id: ConversationId,
        content: String,
        kind: MessageKind,
        file_type: Option<String>,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
        kind: MessageKind,
        file_type: Option<String>,
    },
    ConversationUpdated(ConversationPreview),
    Typing {
        sender_id: UserId,
    },
    StopTyping {
        sender_id: UserId,
    },
    NewGroupMessage(GroupMessagePayload),
    GroupMessageRecalled {
        message_id: MessageId,
        group_id: GroupId,
        content: String,
        recalled_by: UserId,
        recalled_at: DateTime<Utc>,
    },
    GroupHistory {
        group_id: GroupId,
        messages: Vec<GroupMessagePayload>,
        unread_count: u64,
    },
    UserJoined {
        user_id: UserId,
        group_id: GroupId,
    },
    UserLeft {
        user_id: UserId,
        group_id: GroupId,
    },
    MessageForwarded {
        message: ForwardedMessage,
    },
    IncomingCall {
        call_id: CallId,
        caller_id: UserId,
        room_name: String,
        call_type: CallKind,
    },
    InviteSent {
        call_id: CallId,
        callee_id: UserId,
        room_name: String,
        status: CallStatus,
    },
    CallAccepted {
        call_id: CallId,
        room_name: String,
    },
    CallDeclined {
        call_id: CallId,
    },
    CallTimeout {
        call_id: CallId,
    },
    CallEnded {
        call_id: CallId,
        ended_by: UserId,
        duration: i64,
    },
    Error {
        kind: String,
        message: String,
        temp_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserOnline { .. } => "user-online",
            Self::UserOffline { .. } => "user-offline",
            Self::NewMessage(_) => "new-message",
            Self::MessageSent { .. } => "message-sent",
            Self::MessageRecalled { .. } => "message-recalled",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::ConversationUpdated(_) => "conversation-updated",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop-typing",
            Self::NewGroupMessage(_) => "new-group-message",
            Self::GroupMessageRecalled { .. } => "group-message-recalled",
            Self::GroupHistory { .. } => "group-history",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::MessageForwarded { .. } => "message-forwarded",
            Self::IncomingCall { .. } => "incoming-call",
            Self::InviteSent { .. } => "invite-sent",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallDeclined { .. } => "call-declined",
            Self::CallTimeout { .. } => "call-timeout",
            Self::CallEnded { .. } => "call-ended",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
