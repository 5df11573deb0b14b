use std::iter;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::engine::{Engine, EngineConfig, EngineConnector, Interrupt};
use crate::error::{EngineError, SessionError};
use crate::fault::{self, FATAL_STATE_MESSAGE};
use crate::sqlite::SqliteConnector;

/// Correlation key chosen by the host for one request.
pub type QueryId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    /// The engine was torn down after an unrecoverable error. Only a fresh
    /// `initialize` leaves this state.
    Fatal,
}

/// Owns one engine instance and serializes every statement against it.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct EngineSession {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn EngineConnector>,
    config: EngineConfig,
    state: Mutex<SessionState>,
    engine: Mutex<Option<Box<dyn Engine>>>,
    interrupter: Mutex<Option<Arc<dyn Interrupt>>>,
    running: Mutex<Option<QueryId>>,
    reclaim_pending: AtomicBool,
}

type BatchResult = Result<RecordBatch, SessionError>;

/// Batches of one statement, in engine order. Ends after the last batch or
/// after the first error.
pub struct BatchStream {
    rx: mpsc::Receiver<BatchResult>,
    task: Option<JoinHandle<()>>,
}

impl BatchStream {
    pub async fn next(&mut self) -> Option<BatchResult> {
        if let Some(item) = self.rx.recv().await {
            return Some(item);
        }
        let task = self.task.take()?;
        match task.await {
            Ok(()) => None,
            Err(err) => Some(Err(err.into())),
        }
    }
}

impl EngineSession {
    pub fn new(connector: Arc<dyn EngineConnector>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                state: Mutex::new(SessionState::Uninitialized),
                engine: Mutex::new(None),
                interrupter: Mutex::new(None),
                running: Mutex::new(None),
                reclaim_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn sqlite(config: EngineConfig) -> Self {
        Self::new(Arc::new(SqliteConnector), config)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Opens the first candidate that passes its probe, falling back to the
    /// connector's default source. Any engine already open is torn down
    /// first. Returns the source that was opened.
    pub async fn initialize(&self, candidates: Vec<String>) -> Result<String, SessionError> {
        self.shared.set_state(SessionState::Initializing);
        if let Some(interrupter) = self.shared.interrupter() {
            interrupter.interrupt();
        }
        let shared = self.shared.clone();
        let outcome = tokio::task::spawn_blocking(move || shared.open_engine(&candidates)).await;
        let result = outcome.map_err(SessionError::from).and_then(|inner| inner);
        if result.is_err() {
            self.shared.set_state(SessionState::Uninitialized);
        }
        result
    }

    /// Starts `sql` on a blocking thread. Fails fast when the session cannot
    /// run statements; engine errors arrive through the stream.
    pub fn execute(
        &self,
        query_id: QueryId,
        sql: String,
        cancel: CancelToken,
    ) -> Result<BatchStream, SessionError> {
        self.shared.check_ready()?;
        let (tx, rx) = mpsc::channel(1);
        let shared = self.shared.clone();
        let task =
            tokio::task::spawn_blocking(move || shared.run_statement(query_id, &sql, &cancel, &tx));
        Ok(BatchStream {
            rx,
            task: Some(task),
        })
    }

    /// Interrupts the statement of `query_id` if it currently owns the
    /// engine. Returns whether an interrupt was delivered.
    pub fn cancel(&self, query_id: &str) -> bool {
        let running = lock(&self.shared.running);
        if running.as_deref() != Some(query_id) {
            return false;
        }
        match lock(&self.shared.interrupter).as_ref() {
            Some(interrupter) => {
                interrupter.interrupt();
                debug!(query_id, "interrupted running statement");
                true
            }
            None => false,
        }
    }

    /// Closes the engine and returns to `Uninitialized`. Teardown errors are
    /// logged and swallowed.
    pub async fn reset(&self) -> Result<(), SessionError> {
        if let Some(interrupter) = self.shared.interrupter() {
            interrupter.interrupt();
        }
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = lock(&shared.engine);
            shared.teardown(&mut slot);
            shared.set_state(SessionState::Uninitialized);
        })
        .await?;
        info!("engine session reset");
        Ok(())
    }

    pub async fn describe(&self, sql: String) -> Result<SchemaRef, SessionError> {
        self.with_engine(move |engine| engine.describe(&sql)).await
    }

    pub async fn register_file(&self, name: String, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.with_engine(move |engine| engine.register_file(&name, &bytes))
            .await
    }

    /// Advisory reclamation. Runs immediately when the engine is idle,
    /// otherwise after the current statement finishes.
    pub fn release_memory(&self) {
        let mut slot = match self.shared.engine.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.shared.reclaim_pending.store(true, Ordering::SeqCst);
                return;
            }
        };
        if let Some(engine) = slot.as_mut() {
            release(&mut **engine);
        }
    }

    async fn with_engine<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Engine) -> Result<T, EngineError> + Send + 'static,
    {
        self.shared.check_ready()?;
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.with_engine_blocking(op)).await?
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = ?*state, to = ?next, "session state");
            *state = next;
        }
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        lock(&self.interrupter).clone()
    }

    fn check_ready(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Ready | SessionState::Running => Ok(()),
            SessionState::Fatal => Err(SessionError::Fatal {
                message: FATAL_STATE_MESSAGE.to_string(),
            }),
            SessionState::Uninitialized | SessionState::Initializing => {
                Err(SessionError::NotInitialized)
            }
        }
    }

    fn unavailable(&self) -> SessionError {
        match self.state() {
            SessionState::Fatal => SessionError::Fatal {
                message: FATAL_STATE_MESSAGE.to_string(),
            },
            _ => SessionError::NotInitialized,
        }
    }

    fn open_engine(&self, candidates: &[String]) -> Result<String, SessionError> {
        let mut slot = lock(&self.engine);
        self.teardown(&mut slot);
        let (source, mut engine) = self.open_first(candidates)?;
        for setting in self.config.settings() {
            match engine.apply(&setting) {
                Ok(()) => debug!(setting = setting.name(), "engine setting applied"),
                Err(EngineError::Unsupported(reason)) => {
                    debug!(setting = setting.name(), %reason, "engine setting skipped")
                }
                Err(err) => {
                    warn!(setting = setting.name(), error = %err, "engine setting failed")
                }
            }
        }
        *lock(&self.interrupter) = engine.interrupter();
        *slot = Some(engine);
        self.set_state(SessionState::Ready);
        info!(%source, "engine ready");
        Ok(source)
    }

    fn open_first(&self, candidates: &[String]) -> Result<(String, Box<dyn Engine>), SessionError> {
        let fallback = self.connector.default_source();
        let mut last_error = None;
        for source in candidates.iter().map(String::as_str).chain(iter::once(fallback)) {
            let mut engine = match self.connector.open(source) {
                Ok(engine) => engine,
                Err(err) => {
                    warn!(source, error = %err, "engine source unavailable");
                    last_error = Some(err);
                    continue;
                }
            };
            match engine.probe() {
                Ok(()) => {
                    if source == fallback && !candidates.iter().any(|c| c == fallback) {
                        info!(source, "all candidates failed; using default source");
                    }
                    return Ok((source.to_string(), engine));
                }
                Err(err) => {
                    warn!(source, error = %err, "engine probe failed");
                    if let Err(close_err) = engine.close() {
                        debug!(source, error = %close_err, "closing failed probe");
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(SessionError::Unsupported(
            last_error.map_or_else(|| "no candidates".to_string(), |err| err.to_string()),
        ))
    }

    fn run_statement(
        &self,
        query_id: QueryId,
        sql: &str,
        cancel: &CancelToken,
        tx: &mpsc::Sender<BatchResult>,
    ) {
        let mut slot = lock(&self.engine);
        let Some(engine) = slot.as_mut() else {
            let _ = tx.blocking_send(Err(self.unavailable()));
            return;
        };
        *lock(&self.running) = Some(query_id.clone());
        if cancel.is_cancelled() {
            self.clear_running();
            let _ = tx.blocking_send(Err(SessionError::Cancelled));
            return;
        }
        self.set_state(SessionState::Running);
        let started = Instant::now();
        let mut batches = 0usize;
        let mut sink = |batch: RecordBatch| {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            batches += 1;
            match tx.blocking_send(Ok(batch)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        };
        let result = engine.execute(sql, self.config.batch_rows, &mut sink);
        self.clear_running();

        match result {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                debug!(
                    %query_id,
                    batches,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "statement finished"
                );
                if cancel.is_cancelled() {
                    let _ = tx.blocking_send(Err(SessionError::Cancelled));
                }
            }
            Err(err) => {
                let mapped = self.settle_error(&mut slot, &err);
                if !mapped.is_fatal() {
                    self.set_state(SessionState::Ready);
                }
                let _ = tx.blocking_send(Err(mapped));
            }
        }
        self.reclaim_if_pending(&mut slot);
    }

    /// `cancel` only interrupts while holding `running`, so clearing both
    /// under that lock leaves no interrupt behind for the next statement.
    fn clear_running(&self) {
        let mut running = lock(&self.running);
        *running = None;
        if let Some(interrupter) = lock(&self.interrupter).as_ref() {
            interrupter.clear();
        }
    }

    fn with_engine_blocking<T>(
        &self,
        op: impl FnOnce(&mut dyn Engine) -> Result<T, EngineError>,
    ) -> Result<T, SessionError> {
        let mut slot = lock(&self.engine);
        let Some(engine) = slot.as_mut() else {
            return Err(self.unavailable());
        };
        let result = op(&mut **engine);
        let result = result.map_err(|err| self.settle_error(&mut slot, &err));
        self.reclaim_if_pending(&mut slot);
        result
    }

    /// Classifies an engine failure, tearing the engine down when it is fatal.
    fn settle_error(&self, slot: &mut Option<Box<dyn Engine>>, err: &EngineError) -> SessionError {
        let mapped = fault::session_error(err);
        match &mapped {
            SessionError::Fatal { .. } => {
                error!(error = %err, "engine reported an unrecoverable error");
                self.teardown(slot);
                self.set_state(SessionState::Fatal);
            }
            SessionError::OutOfMemory { detail, .. } => {
                warn!(%detail, "engine ran out of memory");
            }
            SessionError::Cancelled => debug!("statement interrupted"),
            other => debug!(error = %other, "statement failed"),
        }
        mapped
    }

    fn teardown(&self, slot: &mut Option<Box<dyn Engine>>) {
        lock(&self.interrupter).take();
        if let Some(engine) = slot.take() {
            if let Err(err) = engine.close() {
                warn!(error = %err, "engine close failed during teardown");
            }
        }
    }

    fn reclaim_if_pending(&self, slot: &mut Option<Box<dyn Engine>>) {
        if !self.reclaim_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = slot.as_mut() {
            release(&mut **engine);
        }
    }
}

fn release(engine: &mut dyn Engine) {
    match engine.release_memory() {
        Ok(()) => debug!("engine memory released"),
        Err(err) => warn!(error = %err, "engine memory release failed"),
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSetting;
    use crate::scripted::{DEFAULT_SOURCE, Reply, ScriptedConnector};
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::time::Duration;

    fn batch(values: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
            .expect("batch")
    }

    fn session(connector: &ScriptedConnector) -> EngineSession {
        EngineSession::new(Arc::new(connector.clone()), EngineConfig::default())
    }

    async fn drain(stream: &mut BatchStream) -> (Vec<RecordBatch>, Option<SessionError>) {
        let mut batches = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(batch) => batches.push(batch),
                Err(err) => return (batches, Some(err)),
            }
        }
        (batches, None)
    }

    #[tokio::test]
    async fn initialize_falls_back_past_unreachable_candidates() {
        let connector = ScriptedConnector::new();
        connector.unreachable("cdn-a").unreachable("cdn-b");
        let session = session(&connector);
        let source = session
            .initialize(vec!["cdn-a".into(), "cdn-b".into()])
            .await
            .expect("initialize");
        assert_eq!(source, DEFAULT_SOURCE);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(connector.log().opened, vec![DEFAULT_SOURCE.to_string()]);
    }

    #[tokio::test]
    async fn setting_failures_are_swallowed() {
        let connector = ScriptedConnector::new();
        connector.reject_setting("preserve_insertion_order");
        let session = session(&connector);
        session
            .initialize(vec!["primary".into()])
            .await
            .expect("initialize");
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            connector.log().settings,
            vec![EngineSetting::PreserveInsertionOrder(false)]
        );
    }

    #[tokio::test]
    async fn execute_requires_initialize() {
        let session = session(&ScriptedConnector::new());
        let err = session
            .execute("q".into(), "SELECT 1".into(), CancelToken::new())
            .err()
            .expect("not initialized");
        assert_eq!(err, SessionError::NotInitialized);
    }

    #[tokio::test]
    async fn batches_arrive_in_order() {
        let connector = ScriptedConnector::new();
        connector.reply("SELECT v", Reply::Batches(vec![batch(&[1, 2]), batch(&[3])]));
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");
        let mut stream = session
            .execute("q".into(), "SELECT v".into(), CancelToken::new())
            .expect("execute");
        let (batches, err) = drain(&mut stream).await;
        assert!(err.is_none());
        let rows: Vec<_> = batches.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(rows, vec![2, 1]);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn fatal_error_tears_down_until_reinitialized() {
        let connector = ScriptedConnector::new();
        connector
            .reply(
                "SELECT boom",
                Reply::Fail("FATAL Error: database has been invalidated".into()),
            )
            .reply("SELECT v", Reply::Batches(vec![batch(&[1])]));
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");

        let mut stream = session
            .execute("q1".into(), "SELECT boom".into(), CancelToken::new())
            .expect("execute");
        let (_, err) = drain(&mut stream).await;
        assert!(err.expect("error").is_fatal());
        assert_eq!(session.state(), SessionState::Fatal);
        assert_eq!(connector.log().closed, 1);

        let err = session
            .execute("q2".into(), "SELECT v".into(), CancelToken::new())
            .err()
            .expect("fails fast");
        assert_eq!(err.kind(), "fatal");
        assert_eq!(err.to_string(), FATAL_STATE_MESSAGE);

        session.initialize(vec![]).await.expect("reinitialize");
        let mut stream = session
            .execute("q3".into(), "SELECT v".into(), CancelToken::new())
            .expect("execute");
        let (batches, err) = drain(&mut stream).await;
        assert!(err.is_none());
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn out_of_memory_keeps_session_ready() {
        let connector = ScriptedConnector::new();
        connector.reply(
            "SELECT big",
            Reply::Fail("Out of Memory Error: failed to allocate data of size 2.0 GiB".into()),
        );
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");
        let mut stream = session
            .execute("q".into(), "SELECT big".into(), CancelToken::new())
            .expect("execute");
        let (_, err) = drain(&mut stream).await;
        assert_eq!(err.expect("error").kind(), "out_of_memory");
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(connector.log().closed, 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_the_running_statement() {
        let connector = ScriptedConnector::new();
        connector.reply("SELECT slow", Reply::Hang);
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");
        let token = CancelToken::new();
        let mut stream = session
            .execute("slow".into(), "SELECT slow".into(), token.clone())
            .expect("execute");

        assert!(!session.cancel("other"));
        let mut delivered = false;
        for _ in 0..200 {
            if session.cancel("slow") {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(delivered);
        token.cancel();
        let (_, err) = tokio::time::timeout(Duration::from_secs(5), drain(&mut stream))
            .await
            .expect("stream ends");
        assert_eq!(err, Some(SessionError::Cancelled));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn reset_closes_engine() {
        let connector = ScriptedConnector::new();
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");
        session.reset().await.expect("reset");
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(connector.log().closed, 1);
        assert!(session.describe("SELECT 1".into()).await.is_err());
    }

    #[tokio::test]
    async fn register_file_and_describe() {
        let connector = ScriptedConnector::new();
        connector.reply("SELECT v", Reply::Batches(vec![batch(&[1])]));
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");

        session
            .register_file("data.csv".into(), vec![1, 2, 3])
            .await
            .expect("register");
        assert_eq!(connector.log().files, vec![("data.csv".to_string(), 3)]);

        let err = session
            .register_file("data.bad".into(), vec![])
            .await
            .expect_err("unsupported");
        assert_eq!(err.kind(), "query");
        assert_eq!(session.state(), SessionState::Ready);

        let schema = session.describe("SELECT v".into()).await.expect("describe");
        assert_eq!(schema.field(0).name(), "v");
    }

    #[tokio::test]
    async fn release_memory_runs_when_idle() {
        let connector = ScriptedConnector::new();
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");
        session.release_memory();
        assert_eq!(connector.log().released, 1);
    }

    #[tokio::test]
    async fn release_memory_waits_for_the_running_statement() {
        let connector = ScriptedConnector::new();
        connector.reply("SELECT slow", Reply::Hang);
        let session = session(&connector);
        session.initialize(vec![]).await.expect("initialize");
        let token = CancelToken::new();
        let mut stream = session
            .execute("slow".into(), "SELECT slow".into(), token.clone())
            .expect("execute");
        for _ in 0..200 {
            if session.state() == SessionState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.state(), SessionState::Running);

        session.release_memory();
        assert_eq!(connector.log().released, 0);

        token.cancel();
        assert!(session.cancel("slow"));
        let (_, err) = tokio::time::timeout(Duration::from_secs(5), drain(&mut stream))
            .await
            .expect("stream ends");
        assert_eq!(err, Some(SessionError::Cancelled));
        assert_eq!(connector.log().released, 1);
    }

    async fn run_sqlite(
        session: &EngineSession,
        sql: &str,
    ) -> (Vec<RecordBatch>, Option<SessionError>) {
        let mut stream = session
            .execute("q".into(), sql.into(), CancelToken::new())
            .expect("execute");
        drain(&mut stream).await
    }

    #[tokio::test]
    async fn sqlite_query_errors_keep_existing_tables() {
        let session = EngineSession::sqlite(EngineConfig::default());
        session.initialize(vec![]).await.expect("initialize");
        for sql in [
            "CREATE TABLE hosts (name TEXT)",
            "INSERT INTO hosts VALUES ('alpha')",
        ] {
            let (_, err) = run_sqlite(&session, sql).await;
            assert!(err.is_none(), "{sql}: {err:?}");
        }

        let (_, err) = run_sqlite(&session, "SELECT unreachable FROM hosts").await;
        let err = err.expect("unknown column");
        assert_eq!(err.kind(), "query");
        assert!(err.to_string().contains("no such column"));
        assert_eq!(session.state(), SessionState::Ready);

        let (batches, err) = run_sqlite(&session, "SELECT name FROM hosts").await;
        assert!(err.is_none());
        assert_eq!(batches[0].num_rows(), 1);
    }

    #[tokio::test]
    async fn sqlite_session_runs_queries() {
        let session = EngineSession::sqlite(EngineConfig::default());
        let source = session
            .initialize(vec!["/nonexistent/sluice.db".into()])
            .await
            .expect("initialize");
        assert_eq!(source, ":memory:");
        let mut stream = session
            .execute("q".into(), "SELECT 1 AS one".into(), CancelToken::new())
            .expect("execute");
        let (batches, err) = drain(&mut stream).await;
        assert!(err.is_none());
        assert_eq!(batches[0].num_rows(), 1);
    }
}
