//! # courier-store
//!
//! Persistent storage for the courier messaging backend, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every record the
//! server keeps: conversation rows, direct messages, the group message log,
//! group membership and call records. Conditional writes (call transitions,
//! call-message deduplication) are single statements so concurrent callers
//! cannot both win.

pub mod calls;
pub mod conversations;
pub mod database;
pub mod group_messages;
pub mod members;
pub mod messages;
pub mod migrations;
pub mod models;

mod codec;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
