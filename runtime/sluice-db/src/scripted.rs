//! Replaying engine for tests.
//!
//! Statements are matched by exact SQL text against a script of canned
//! replies. The script and an activity log are shared between the connector
//! and every engine it opens, so a test can keep the connector and inspect
//! what the session did after the fact.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::engine::{BatchSink, Engine, EngineConnector, EngineSetting, Interrupt};
use crate::error::EngineError;

pub const DEFAULT_SOURCE: &str = "scripted:default";

#[derive(Clone, Debug)]
pub enum Reply {
    Batches(Vec<RecordBatch>),
    /// Fails with the given engine error text.
    Fail(String),
    /// Blocks until the statement is interrupted.
    Hang,
}

/// Everything the engines opened by one connector were asked to do.
#[derive(Clone, Debug, Default)]
pub struct ScriptLog {
    pub opened: Vec<String>,
    pub settings: Vec<EngineSetting>,
    pub executed: Vec<String>,
    pub files: Vec<(String, usize)>,
    pub released: usize,
    pub closed: usize,
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, Reply>,
    unreachable: HashSet<String>,
    rejected_settings: HashSet<&'static str>,
    log: ScriptLog,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, sql: impl Into<String>, reply: Reply) -> &Self {
        self.script().replies.insert(sql.into(), reply);
        self
    }

    /// Opening `source` fails as if it could not be fetched.
    pub fn unreachable(&self, source: impl Into<String>) -> &Self {
        self.script().unreachable.insert(source.into());
        self
    }

    pub fn reject_setting(&self, name: &'static str) -> &Self {
        self.script().rejected_settings.insert(name);
        self
    }

    pub fn log(&self) -> ScriptLog {
        self.script().log.clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }
}

impl EngineConnector for ScriptedConnector {
    fn open(&self, source: &str) -> Result<Box<dyn Engine>, EngineError> {
        let mut script = self.script();
        if script.unreachable.contains(source) {
            return Err(EngineError::Message(format!("failed to fetch {source}")));
        }
        script.log.opened.push(source.to_string());
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn default_source(&self) -> &str {
        DEFAULT_SOURCE
    }
}

pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    interrupted: Arc<AtomicBool>,
}

impl Engine for ScriptedEngine {
    fn probe(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn apply(&mut self, setting: &EngineSetting) -> Result<(), EngineError> {
        let mut script = lock(&self.script);
        script.log.settings.push(setting.clone());
        if script.rejected_settings.contains(setting.name()) {
            return Err(EngineError::Message(format!(
                "Catalog Error: unrecognized configuration parameter \"{}\"",
                setting.name()
            )));
        }
        Ok(())
    }

    fn execute(
        &mut self,
        sql: &str,
        _batch_rows: usize,
        sink: &mut BatchSink<'_>,
    ) -> Result<(), EngineError> {
        let reply = {
            let mut script = lock(&self.script);
            script.log.executed.push(sql.to_string());
            script.replies.get(sql).cloned()
        };
        match reply {
            Some(Reply::Batches(batches)) => {
                for batch in batches {
                    if self.interrupted.swap(false, Ordering::SeqCst) {
                        return Err(EngineError::Interrupted);
                    }
                    if sink(batch).is_break() {
                        break;
                    }
                }
                Ok(())
            }
            Some(Reply::Fail(message)) => Err(EngineError::Message(message)),
            Some(Reply::Hang) => loop {
                if self.interrupted.swap(false, Ordering::SeqCst) {
                    return Err(EngineError::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(1));
            },
            None => Err(EngineError::Message(format!(
                "Parser Error: syntax error at or near \"{sql}\""
            ))),
        }
    }

    fn describe(&mut self, sql: &str) -> Result<SchemaRef, EngineError> {
        match lock(&self.script).replies.get(sql) {
            Some(Reply::Batches(batches)) => Ok(batches
                .first()
                .map(RecordBatch::schema)
                .unwrap_or_else(|| Arc::new(Schema::empty()))),
            Some(Reply::Fail(message)) => Err(EngineError::Message(message.clone())),
            _ => Err(EngineError::Message(format!(
                "Parser Error: syntax error at or near \"{sql}\""
            ))),
        }
    }

    fn register_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        if name.ends_with(".bad") {
            return Err(EngineError::Unsupported(format!("cannot read {name}")));
        }
        lock(&self.script)
            .log
            .files
            .push((name.to_string(), bytes.len()));
        Ok(())
    }

    fn release_memory(&mut self) -> Result<(), EngineError> {
        lock(&self.script).log.released += 1;
        Ok(())
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(ScriptedInterrupt(self.interrupted.clone())))
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        lock(&self.script).log.closed += 1;
        Ok(())
    }
}

struct ScriptedInterrupt(Arc<AtomicBool>);

impl Interrupt for ScriptedInterrupt {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
