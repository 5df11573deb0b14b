//! Embedded engine layer for the sluice worker.
//!
//! The worker never touches the engine directly: it asks an [`EngineSession`]
//! to run a statement and receives Arrow record batches over a bounded
//! channel. The session owns the connection, serializes statements on a
//! blocking thread, classifies engine failures and tears the engine down when
//! it reports an unrecoverable state.

mod cancel;
mod engine;
mod error;
pub mod fault;
mod session;
pub mod sqlite;

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use cancel::CancelToken;
pub use engine::{BatchSink, Engine, EngineConfig, EngineConnector, EngineSetting, Interrupt};
pub use error::{EngineError, SessionError};
pub use fault::{FaultClass, classify};
pub use session::{BatchStream, EngineSession, QueryId, SessionState};
pub use sqlite::{SqliteConnector, SqliteEngine};
