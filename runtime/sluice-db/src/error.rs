use arrow::error::ArrowError;
use thiserror::Error;

/// Raw failure reported by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A registered database image could not be attached. The main
    /// database is unaffected.
    #[error("cannot attach '{alias}': {source}")]
    Attach {
        alias: String,
        source: rusqlite::Error,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error text produced by the engine itself.
    #[error("{0}")]
    Message(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("statement interrupted")]
    Interrupted,
}

/// Failure surfaced by [`crate::EngineSession`] after classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("engine is not initialized; send init before running queries")]
    NotInitialized,

    /// The engine was invalidated and has been torn down.
    #[error("{message}")]
    Fatal { message: String },

    #[error("{message}")]
    OutOfMemory { message: String, detail: String },

    #[error("{0}")]
    Query(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("no engine source could be opened: {0}")]
    Unsupported(String),

    #[error("engine task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Stable identifier carried in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotInitialized => "not_initialized",
            SessionError::Fatal { .. } => "fatal",
            SessionError::OutOfMemory { .. } => "out_of_memory",
            SessionError::Query(_) => "query",
            SessionError::Cancelled => "cancelled",
            SessionError::Unsupported(_) => "unsupported",
            SessionError::Task(_) => "internal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Fatal { .. })
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Task(err.to_string())
    }
}
