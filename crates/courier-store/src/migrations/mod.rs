//! Database migration runner.
//!
//! Migrations are executed in order on every [`crate::Database::open_at`] /
//! [`crate::Database::open_in_memory`] call. Each migration is guarded by the
//! `user_version` pragma so it runs exactly once.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered schema steps. Step `n` (1-based) moves `user_version` from `n - 1`
/// to `n`.
const MIGRATIONS: &[(&str, Migration)] = &[("v001_initial", v001_initial::up)];

/// Current schema version.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Run all pending migrations against the open connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current >= CURRENT_VERSION {
        tracing::debug!(version = current, "database schema up to date");
        return Ok(());
    }

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "migrating database"
    );

    for (version, (name, up)) in (1u32..).zip(MIGRATIONS) {
        if version <= current {
            continue;
        }
        tracing::info!(migration = name, "applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
