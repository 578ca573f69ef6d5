//! Storage error types.

/// Errors produced by relation, warehouse and fact-sink operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure tagged with the operation that raised it.
    #[error("{context}: {source}")]
    SqliteContext {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Table or column name that cannot be safely spliced into SQL.
    #[error("invalid sql identifier '{0}'")]
    InvalidIdentifier(String),

    /// Stored value that cannot be represented in the data model.
    #[error("cannot decode column '{column}': {reason}")]
    Decode { column: String, reason: String },

    /// Relation read that failed outside the database layer.
    #[error("relation unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Wrap a `SQLite` error with the name of the failing operation.
    #[must_use]
    pub fn context(context: &'static str, source: rusqlite::Error) -> Self {
        Self::SqliteContext { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
