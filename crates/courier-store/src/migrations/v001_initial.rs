//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `conversations`, `messages`,
//! `group_messages`, `group_members` and `calls`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations: one row per participant of a two-party chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    conversation_id      TEXT NOT NULL,             -- sorted "a_b"
    participant_id       TEXT NOT NULL,             -- owner of this row
    other_participant_id TEXT NOT NULL,
    last_content         TEXT NOT NULL,
    last_sender_id       TEXT NOT NULL,
    last_kind            TEXT NOT NULL,
    last_file_type       TEXT,
    last_timestamp       TEXT NOT NULL,
    unread_count         INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,             -- never rewritten
    updated_at           TEXT NOT NULL,

    PRIMARY KEY (conversation_id, participant_id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_participant
    ON conversations(participant_id, updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_other
    ON conversations(other_participant_id, updated_at DESC);

-- ----------------------------------------------------------------
-- Direct messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    message_id      TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    receiver_id     TEXT NOT NULL,
    content         TEXT NOT NULL,
    file_type       TEXT,
    timestamp       TEXT NOT NULL,
    status          TEXT NOT NULL,              -- sent | delivered | recalled | deleted
    kind            TEXT NOT NULL,              -- text | file | call | system
    call_id         TEXT,
    call_status     TEXT,                       -- started | declined | missed | ended
    duration_secs   INTEGER,
    metadata        TEXT                        -- JSON object
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp DESC);

-- NULLs are distinct, so only call messages participate.
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_call_dedup
    ON messages(conversation_id, call_id, call_status);

-- ----------------------------------------------------------------
-- Group message log (base rows + recall/delete tombstones)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_messages (
    message_id        TEXT PRIMARY KEY NOT NULL,
    group_id          TEXT NOT NULL,
    sender_id         TEXT NOT NULL,
    content           TEXT NOT NULL,
    file_type         TEXT,
    kind              TEXT NOT NULL,            -- text | file | system | recall_record | delete_record
    status            TEXT NOT NULL,
    target_message_id TEXT,                     -- tombstones only
    metadata          TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_group_messages_group_ts
    ON group_messages(group_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_group_messages_target
    ON group_messages(target_message_id);

-- ----------------------------------------------------------------
-- Group membership (managed externally, read by the server)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_members (
    group_id     TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    role         TEXT NOT NULL DEFAULT 'member',
    is_active    INTEGER NOT NULL DEFAULT 1,    -- boolean 0/1
    joined_at    TEXT NOT NULL,
    last_read_at TEXT,

    PRIMARY KEY (group_id, user_id)
);

-- ----------------------------------------------------------------
-- Call records
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    call_id          TEXT PRIMARY KEY NOT NULL,
    caller_id        TEXT NOT NULL,
    callee_id        TEXT NOT NULL,
    call_kind        TEXT NOT NULL,             -- video | audio
    room_name        TEXT NOT NULL,
    max_participants INTEGER NOT NULL,
    status           TEXT NOT NULL,             -- ringing | accepted | declined | ended | missed
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    ended_at         TEXT,
    duration_secs    INTEGER,
    last_activity_at TEXT NOT NULL,
    ended_by         TEXT,
    updated_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(status);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
