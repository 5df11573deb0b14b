use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use sluice_db::EngineSession;
use sluice_worker::config::{LogFormat, WorkerConfig};
use sluice_worker::logging::init_logging;
use sluice_worker::{WireCodec, serve_framed};
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CodecArg {
    Msgpack,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Compact,
    Json,
}

/// Streams query results over length-prefixed frames on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "sluice-worker", version)]
#[command(about = "Query-result streaming worker speaking framed envelopes on stdio", long_about = None)]
struct Args {
    /// TOML configuration file; every field is optional
    #[arg(short = 'c', long = "config", env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Reply codec until the first request arrives
    #[arg(long = "codec", env = "SLUICE_CODEC", value_enum)]
    codec: Option<CodecArg>,

    /// Unacknowledged chunks allowed per query
    #[arg(long = "max-outstanding", env = "SLUICE_MAX_OUTSTANDING")]
    max_outstanding: Option<usize>,

    /// Row ceiling per chunk
    #[arg(long = "chunk-rows", env = "SLUICE_CHUNK_ROWS")]
    chunk_rows: Option<usize>,

    /// Byte ceiling per chunk
    #[arg(long = "chunk-bytes", env = "SLUICE_CHUNK_BYTES")]
    chunk_bytes: Option<usize>,

    /// Engine memory ceiling in bytes
    #[arg(long = "memory-limit", env = "SLUICE_MEMORY_LIMIT")]
    memory_limit: Option<u64>,

    /// Engine worker threads
    #[arg(long = "threads", env = "SLUICE_THREADS")]
    threads: Option<usize>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long = "log-level", env = "SLUICE_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long = "log-format", env = "SLUICE_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormatArg>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => WorkerConfig::default(),
        };
        if let Some(codec) = self.codec {
            config.transport.codec = match codec {
                CodecArg::Msgpack => WireCodec::Msgpack,
                CodecArg::Json => WireCodec::Json,
            };
        }
        if let Some(max_outstanding) = self.max_outstanding {
            config.backpressure.max_outstanding = max_outstanding;
        }
        if let Some(rows) = self.chunk_rows {
            config.chunk.max_rows = rows;
        }
        if let Some(bytes) = self.chunk_bytes {
            config.chunk.max_bytes = bytes;
        }
        if self.memory_limit.is_some() {
            config.engine.memory_limit_bytes = self.memory_limit;
        }
        if self.threads.is_some() {
            config.engine.threads = self.threads;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = match format {
                LogFormatArg::Compact => LogFormat::Compact,
                LogFormatArg::Json => LogFormat::Json,
            };
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        codec = ?config.transport.codec,
        max_outstanding = config.backpressure.max_outstanding,
        "sluice worker starting"
    );

    let session = EngineSession::sqlite(config.engine.to_engine_config());
    serve_framed(config, session, std::io::stdin(), std::io::stdout()).await?;
    info!("input closed; worker exiting");
    Ok(())
}
