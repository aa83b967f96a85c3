/// Application name
pub const APP_NAME: &str = "courier";

/// Maximum length of a text message, in characters
pub const MAX_MESSAGE_CHARS: usize = 200;

/// Messages older than this can no longer be recalled
pub const RECALL_WINDOW_HOURS: i64 = 24;

/// Unanswered calls become `missed` after this many seconds
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;

/// Participant limit of a one-to-one call room
pub const PEER_TO_PEER_MAX_PARTICIPANTS: u32 = 2;

/// Content shown in place of a recalled message
pub const RECALL_PLACEHOLDER: &str = "Message has been recalled";

/// Conversation preview after a message was deleted
pub const DELETE_PLACEHOLDER: &str = "Message has been deleted";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default page size for conversation listings
pub const DEFAULT_CONVERSATION_PAGE: u32 = 20;

/// Default page size for message history
pub const DEFAULT_HISTORY_PAGE: u32 = 50;

/// Hard upper bound for any page size
pub const MAX_PAGE_SIZE: u32 = 100;

/// Separator used when joining two user ids into a conversation id
pub const CONVERSATION_ID_SEPARATOR: char = '_';
