//! Error taxonomy shared by the store, the tool layer, and the server.
//!
//! Library code returns [`Result`]; the `codectx` binary wraps these in
//! `anyhow` at the edge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration or input, rejected before any mutation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A uniqueness constraint would be violated. The operation was aborted.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A tool was invoked on the unbound server instance.
    #[error("no project bound to this connection; connect to /mcp/<projectId>")]
    MissingProject,

    /// Listener bind failure, shutdown timeout, unsupported protocol.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// True when a database error was raised by a UNIQUE or PRIMARY KEY constraint.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
