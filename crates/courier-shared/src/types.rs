use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::CONVERSATION_ID_SEPARATOR;
use crate::error::ProtocolError;

// User identity as issued by the external auth service (phone number or id)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a two-party conversation: both user ids, sorted and joined.
///
/// The value is independent of argument order, so either participant can
/// derive it without a lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn between(a: &UserId, b: &UserId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}{}{}",
            first.as_str(),
            CONVERSATION_ID_SEPARATOR,
            second.as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(MessageId);
uuid_id!(CallId);
uuid_id!(SessionId);

// String-backed enums that are persisted as text and sent over the wire.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ProtocolError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(MessageStatus, "message status", {
    Sent => "sent",
    Delivered => "delivered",
    Recalled => "recalled",
    Deleted => "deleted",
});

text_enum!(MessageKind, "message kind", {
    Text => "text",
    File => "file",
    Call => "call",
    System => "system",
});

text_enum!(GroupEntryKind, "group entry kind", {
    Text => "text",
    File => "file",
    System => "system",
    RecallRecord => "recall_record",
    DeleteRecord => "delete_record",
});

impl GroupEntryKind {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::RecallRecord | Self::DeleteRecord)
    }
}

text_enum!(CallStatus, "call status", {
    Ringing => "ringing",
    Accepted => "accepted",
    Declined => "declined",
    Ended => "ended",
    Missed => "missed",
});

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ringing | Self::Accepted)
    }

    /// `ringing -> {accepted, declined, missed, ended}`, `accepted -> ended`.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match (self, next) {
            (Self::Ringing, Self::Accepted)
            | (Self::Ringing, Self::Declined)
            | (Self::Ringing, Self::Missed)
            | (Self::Ringing, Self::Ended)
            | (Self::Accepted, Self::Ended) => true,
            _ => false,
        }
    }
}

text_enum!(CallMessageStatus, "call message status", {
    Started => "started",
    Declined => "declined",
    Missed => "missed",
    Ended => "ended",
});

impl CallMessageStatus {
    /// The chat-visible status produced by entering `status`, if any.
    /// Acceptance itself never produces a chat message.
    pub fn for_transition(status: CallStatus) -> Option<Self> {
        match status {
            CallStatus::Ringing => Some(Self::Started),
            CallStatus::Accepted => None,
            CallStatus::Declined => Some(Self::Declined),
            CallStatus::Missed => Some(Self::Missed),
            CallStatus::Ended => Some(Self::Ended),
        }
    }
}

text_enum!(CallKind, "call kind", {
    Video => "video",
    Audio => "audio",
});

impl Default for CallKind {
    fn default() -> Self {
        Self::Video
    }
}

text_enum!(ForwardTargetKind, "forward target", {
    Group => "group",
    Conversation => "conversation",
});
