//! Streaming query-result worker.
//!
//! A host sends `run` requests over a message channel; the worker executes
//! them on an [`sluice_db::EngineSession`], normalizes every cell into a
//! host-safe value, groups rows into bounded chunks and only sends a chunk
//! while the query has fewer unacknowledged chunks than the configured
//! ceiling.

pub mod backpressure;
pub mod chunk;
pub mod config;
pub mod convert;
pub mod logging;
pub mod transport;
pub mod worker;

pub use backpressure::{BackpressureConfig, BackpressureGovernor, FlowState, MemoryProbe};
pub use chunk::{Chunk, ChunkAssembler, ChunkLimits};
pub use config::{ConfigError, WorkerConfig};
pub use convert::{NormalizedValue, RawColumnValue, Row, normalize_scalar};
pub use transport::{ChunkEncoding, Inbound, Outbound, Outlet, TransportError, WireCodec};
pub use worker::{WorkerError, WorkerHandle, serve, serve_framed, serve_with_probe};
