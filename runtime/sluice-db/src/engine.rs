use std::ops::ControlFlow;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::error::EngineError;

/// Receives batches as the engine produces them. Returning `Break` stops the
/// statement early; the engine finalizes it and returns `Ok(())`.
pub type BatchSink<'a> = dyn FnMut(RecordBatch) -> ControlFlow<()> + 'a;

/// Aborts the statement currently running on a connection, from another thread.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);

    /// Discards an interrupt that is still pending once the statement has
    /// ended, so it cannot hit the next one.
    fn clear(&self) {}
}

/// Post-connect tuning applied once per engine instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineSetting {
    MemoryLimit(u64),
    Threads(usize),
    PreserveInsertionOrder(bool),
    TimeZone(String),
}

impl EngineSetting {
    pub fn name(&self) -> &'static str {
        match self {
            EngineSetting::MemoryLimit(_) => "memory_limit",
            EngineSetting::Threads(_) => "threads",
            EngineSetting::PreserveInsertionOrder(_) => "preserve_insertion_order",
            EngineSetting::TimeZone(_) => "time_zone",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub memory_limit_bytes: Option<u64>,
    pub threads: Option<usize>,
    pub preserve_insertion_order: bool,
    pub time_zone: Option<String>,
    /// Rows per record batch pulled from the engine.
    pub batch_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: None,
            threads: None,
            preserve_insertion_order: false,
            time_zone: None,
            batch_rows: 1024,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> Vec<EngineSetting> {
        let mut settings = Vec::new();
        if let Some(limit) = self.memory_limit_bytes {
            settings.push(EngineSetting::MemoryLimit(limit));
        }
        if let Some(threads) = self.threads {
            settings.push(EngineSetting::Threads(threads));
        }
        settings.push(EngineSetting::PreserveInsertionOrder(
            self.preserve_insertion_order,
        ));
        if let Some(tz) = &self.time_zone {
            settings.push(EngineSetting::TimeZone(tz.clone()));
        }
        settings
    }
}

/// One open engine instance. All methods run on a blocking thread and the
/// session guarantees exclusive access, so implementations need `Send` only.
pub trait Engine: Send {
    /// Cheap liveness check run right after opening.
    fn probe(&mut self) -> Result<(), EngineError>;

    fn apply(&mut self, setting: &EngineSetting) -> Result<(), EngineError>;

    fn execute(
        &mut self,
        sql: &str,
        batch_rows: usize,
        sink: &mut BatchSink<'_>,
    ) -> Result<(), EngineError>;

    fn describe(&mut self, sql: &str) -> Result<SchemaRef, EngineError>;

    /// Makes a named binary blob queryable.
    fn register_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError>;

    /// Advisory; engines without a reclamation hook ignore it.
    fn release_memory(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }

    fn close(self: Box<Self>) -> Result<(), EngineError>;
}

/// Opens engine instances from source locations.
pub trait EngineConnector: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn Engine>, EngineError>;

    /// Known-good source used when every candidate fails its probe.
    fn default_source(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = EngineConfig {
            memory_limit_bytes: Some(1 << 30),
            threads: Some(2),
            preserve_insertion_order: false,
            time_zone: Some("UTC".into()),
            batch_rows: 10,
        };
        let names: Vec<_> = config.settings().iter().map(EngineSetting::name).collect();
        assert_eq!(
            names,
            vec!["memory_limit", "threads", "preserve_insertion_order", "time_zone"]
        );
    }

    #[test]
    fn default_config_only_sets_insertion_order() {
        assert_eq!(
            EngineConfig::default().settings(),
            vec![EngineSetting::PreserveInsertionOrder(false)]
        );
    }
}
