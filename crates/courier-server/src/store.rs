//! Shared handle to the SQLite database.
//!
//! Every engine goes through [`Store::run`], which holds the connection lock
//! for the duration of one closure. Closures only touch the database; no
//! engine awaits or pushes events while holding the lock.

use std::path::Path;
use std::sync::{Arc, Mutex};

use courier_store::{Database, StoreError};

use crate::error::ServerError;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn run<T>(
        &self,
        f: impl FnOnce(&Database) -> courier_store::Result<T>,
    ) -> Result<T, ServerError> {
        let db = self
            .db
            .lock()
            .map_err(|_| ServerError::Upstream("database lock poisoned".to_string()))?;
        f(&db).map_err(ServerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_shared::types::{MessageKind, UserId};
    use courier_store::DirectMessage;

    #[test]
    fn data_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("courier.db");
        let message = DirectMessage::new(
            &UserId::from("alice"),
            &UserId::from("bob"),
            "kept",
            MessageKind::Text,
            None,
            Utc::now(),
        );

        let store = Store::open(&path).unwrap();
        store.run(|db| db.insert_message(&message)).unwrap();
        drop(store);

        let reopened = Store::open(&path).unwrap();
        let stored = reopened.run(|db| db.get_message(&message.message_id)).unwrap();
        assert_eq!(stored.content, "kept");
    }
}
