//! Classification of engine failures.
//!
//! SQLite failures carry an extended result code, which decides the class on
//! its own. Engines that only report text are matched against signatures
//! anchored at the start of the message, or right after a leading
//! `<Category> Error:` tag, so identifiers and SQL echoed later in the text
//! never trigger a teardown.

use rusqlite::ErrorCode;

use crate::error::{EngineError, SessionError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// The engine instance is unusable; the session must be rebuilt.
    Fatal,
    /// Allocation failed; the session remains usable.
    OutOfMemory,
    Transient,
}

const FATAL_SIGNATURES: &[&str] = &[
    "database has been invalidated",
    "fatal error",
    "memory access out of bounds",
    "unreachable",
    "database disk image is malformed",
    "file is not a database",
];

const OOM_SIGNATURES: &[&str] = &[
    "out of memory",
    "failed to allocate",
    "could not allocate",
    "memory limit exceeded",
    "allocation failure",
];

pub const OUT_OF_MEMORY_HINT: &str = "Query ran out of memory. Try narrowing the query (add filters, select fewer columns, or apply a LIMIT).";

pub const FATAL_HINT: &str = "The query engine hit an unrecoverable error and was shut down. Reinitialize the worker before running more queries.";

pub const FATAL_STATE_MESSAGE: &str =
    "The query engine is in a fatal state. Reinitialize the worker before running more queries.";

/// Classifies engine-originated error text. Fatal signatures win over
/// out-of-memory ones: an allocation failure that also invalidated the
/// engine still requires a rebuild.
pub fn classify(message: &str) -> FaultClass {
    let lowered = message.to_ascii_lowercase();
    let heads = anchors(&lowered);
    let matches = |signatures: &[&str]| {
        heads
            .iter()
            .flatten()
            .any(|head| signatures.iter().any(|sig| head.starts_with(*sig)))
    };
    if matches(FATAL_SIGNATURES) {
        FaultClass::Fatal
    } else if matches(OOM_SIGNATURES) {
        FaultClass::OutOfMemory
    } else {
        FaultClass::Transient
    }
}

/// The message itself, plus its remainder after a `... error:` category tag.
fn anchors(lowered: &str) -> [Option<&str>; 2] {
    let tagged = lowered
        .split_once(':')
        .filter(|(category, _)| category.trim_end().ends_with("error"))
        .map(|(_, rest)| rest.trim_start());
    [Some(lowered), tagged]
}

/// Result-code classification for SQLite. Corruption is only fatal for the
/// main database; a bad attached image leaves the connection intact.
pub fn classify_sqlite(err: &rusqlite::Error, attached: bool) -> FaultClass {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) if !attached => {
            FaultClass::Fatal
        }
        Some(ErrorCode::OutOfMemory) => FaultClass::OutOfMemory,
        _ => FaultClass::Transient,
    }
}

/// Maps an engine failure to the error the host sees.
pub fn session_error(err: &EngineError) -> SessionError {
    let class = match err {
        EngineError::Interrupted => return SessionError::Cancelled,
        EngineError::Unsupported(_) => FaultClass::Transient,
        EngineError::Sqlite(inner) => classify_sqlite(inner, false),
        EngineError::Attach { source, .. } => classify_sqlite(source, true),
        EngineError::Arrow(_) | EngineError::Io(_) | EngineError::Message(_) => {
            classify(&err.to_string())
        }
    };
    let raw = err.to_string();
    match class {
        FaultClass::Fatal => SessionError::Fatal {
            message: format!("{FATAL_HINT} ({raw})"),
        },
        FaultClass::OutOfMemory => SessionError::OutOfMemory {
            message: OUT_OF_MEMORY_HINT.to_string(),
            detail: raw,
        },
        FaultClass::Transient => SessionError::Query(raw),
    }
}
