use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Any rusqlite failure not mapped to a more specific variant.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// A schema step failed; carries the step name.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Metadata column did not hold valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored id column was not a UUID.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// A stored timestamp was not RFC 3339.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

impl StoreError {
    /// Map `QueryReturnedNoRows` to [`StoreError::NotFound`].
    pub(crate) fn from_query(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        }
    }

    /// A UNIQUE or PRIMARY KEY constraint rejected the write.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
