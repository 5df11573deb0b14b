//! Request loop tying the engine session to the transport.
//!
//! `ack` and `cancel` are handled as soon as they arrive. Every other
//! request goes through a single control task in arrival order, and each
//! `run` gets its own producer task that pulls batches, decodes them,
//! chunks the rows and waits on the backpressure gate before each send.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::error::ArrowError;
use sluice_db::{BatchStream, CancelToken, EngineSession, QueryId, SessionError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backpressure::{BackpressureGovernor, MemoryProbe, ProcessMemory, spawn_memory_monitor};
use crate::chunk::{Chunk, ChunkAssembler, encode_ipc, split_batch};
use crate::config::WorkerConfig;
use crate::convert::BatchDecoder;
use crate::transport::{
    ChunkEncoding, CodecCell, FieldInfo, Inbound, Outbound, Outlet, TransportError,
    spawn_frame_reader, spawn_frame_writer,
};

/// Rows decoded between cooperative yields.
const YIELD_EVERY_ROWS: usize = 256;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to encode chunk: {0}")]
    Encode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("query {0} is already running")]
    DuplicateQuery(QueryId),
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Session(err) => err.kind(),
            WorkerError::Encode(_) => "encode",
            WorkerError::Transport(_) => "transport",
            WorkerError::DuplicateQuery(_) => "duplicate_query",
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Session(SessionError::Cancelled))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Encode(err.to_string())
    }
}

impl From<ArrowError> for WorkerError {
    fn from(err: ArrowError) -> Self {
        WorkerError::Encode(err.to_string())
    }
}

struct Worker {
    config: WorkerConfig,
    session: EngineSession,
    governor: Arc<BackpressureGovernor>,
    outlet: Outlet,
    active: Mutex<HashMap<QueryId, CancelToken>>,
}

/// Serves `inbound` until it closes, sampling memory with the process probe.
pub async fn serve(
    config: WorkerConfig,
    session: EngineSession,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outlet: Outlet,
) {
    serve_with_probe(config, session, inbound, outlet, Box::new(ProcessMemory::new())).await
}

/// Serves `inbound` until it closes. Queries still running at that point are
/// cancelled and their terminal events sent before this returns.
pub async fn serve_with_probe(
    config: WorkerConfig,
    session: EngineSession,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    outlet: Outlet,
    probe: Box<dyn MemoryProbe>,
) {
    let governor = Arc::new(BackpressureGovernor::new(config.backpressure.clone()));
    let monitor = spawn_memory_monitor(&governor, probe);
    let worker = Arc::new(Worker {
        config,
        session,
        governor,
        outlet,
        active: Mutex::new(HashMap::new()),
    });

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let control = tokio::spawn(worker.clone().control_loop(control_rx));

    while let Some(envelope) = inbound.recv().await {
        match envelope {
            Inbound::Ack { id } => worker.governor.on_ack(&id),
            Inbound::Cancel { id } => worker.cancel(&id),
            other => {
                if control_tx.send(other).is_err() {
                    warn!("control task stopped; dropping requests");
                    break;
                }
            }
        }
    }

    debug!("inbound closed; cancelling active queries");
    worker.cancel_all();
    drop(control_tx);
    if let Err(err) = control.await {
        error!(error = %err, "control task failed");
    }
    monitor.abort();
}

impl Worker {
    async fn control_loop(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<Inbound>) {
        let mut producers = JoinSet::new();
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request, &mut producers).await,
                    None => break,
                },
                Some(_) = producers.join_next(), if !producers.is_empty() => {}
            }
        }
        while producers.join_next().await.is_some() {}
    }

    async fn handle(self: &Arc<Self>, request: Inbound, producers: &mut JoinSet<()>) {
        match request {
            Inbound::Init { source_candidates } => {
                self.cancel_all();
                match self.session.initialize(source_candidates).await {
                    Ok(source) => self.send(Outbound::Inited { source }),
                    Err(err) => {
                        warn!(error = %err, "init failed");
                        self.send(Outbound::error(None, err.kind(), err.to_string()));
                    }
                }
            }
            Inbound::Run { id, sql, encoding } => self.start_run(id, sql, encoding, producers),
            Inbound::Describe { id, sql } => match self.session.describe(sql).await {
                Ok(schema) => self.send(Outbound::Schema {
                    fields: schema.fields().iter().map(|f| FieldInfo::from(f.as_ref())).collect(),
                    id,
                }),
                Err(err) => self.send(Outbound::error(Some(&id), err.kind(), err.to_string())),
            },
            Inbound::RegisterFile {
                id,
                file_name,
                file_buffer,
            } => {
                let bytes = file_buffer.len();
                match self.session.register_file(file_name.clone(), file_buffer).await {
                    Ok(()) => {
                        info!(%file_name, bytes, "file registered");
                        self.send(Outbound::FileRegistered { id });
                    }
                    Err(err) => {
                        warn!(%file_name, error = %err, "file registration failed");
                        self.send(Outbound::error(Some(&id), err.kind(), err.to_string()));
                    }
                }
            }
            Inbound::Reset => {
                self.cancel_all();
                match self.session.reset().await {
                    Ok(()) => self.send(Outbound::ResetDone),
                    Err(err) => self.send(Outbound::error(None, err.kind(), err.to_string())),
                }
            }
            Inbound::Ack { id } => self.governor.on_ack(&id),
            Inbound::Cancel { id } => self.cancel(&id),
        }
    }

    fn start_run(
        self: &Arc<Self>,
        id: QueryId,
        sql: String,
        encoding: ChunkEncoding,
        producers: &mut JoinSet<()>,
    ) {
        let cancel = CancelToken::new();
        {
            let mut active = self.active();
            if active.contains_key(&id) {
                let err = WorkerError::DuplicateQuery(id.clone());
                warn!(query_id = %id, "duplicate query id");
                self.send(Outbound::error(Some(&id), err.kind(), err.to_string()));
                return;
            }
            active.insert(id.clone(), cancel.clone());
        }

        let stream = match self.session.execute(id.clone(), sql, cancel.clone()) {
            Ok(stream) => stream,
            Err(err) => {
                self.finish(&id, Err(err.into()));
                return;
            }
        };

        let worker = self.clone();
        producers.spawn(async move {
            let span = info_span!("query", query_id = %id);
            let producer: JoinHandle<Result<(), WorkerError>> = tokio::spawn(
                worker
                    .clone()
                    .produce(id.clone(), encoding, stream, cancel)
                    .instrument(span),
            );
            let outcome = match producer.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(query_id = %id, error = %err, "producer task failed");
                    Err(SessionError::from(err).into())
                }
            };
            worker.finish(&id, outcome);
        });
    }

    async fn produce(
        self: Arc<Self>,
        id: QueryId,
        encoding: ChunkEncoding,
        mut stream: BatchStream,
        cancel: CancelToken,
    ) -> Result<(), WorkerError> {
        let max_depth = self.config.normalizer.max_depth;
        let mut assembler = ChunkAssembler::new(self.config.chunk);
        let mut ordinal: u64 = 0;
        let mut seq: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled.into()),
                next = stream.next() => next,
            };
            let batch = match next {
                Some(Ok(batch)) => batch,
                Some(Err(err)) => return Err(err.into()),
                None => break,
            };

            if self.governor.take_reclaim_request() {
                debug!("memory pressure; releasing engine memory");
                self.session.release_memory();
                tokio::time::sleep(self.governor.reclaim_pause()).await;
            }

            match encoding {
                ChunkEncoding::Json => {
                    let mut decoder = BatchDecoder::new(&batch, max_depth);
                    if let Some(chunk) = assembler.set_columns(decoder.columns()) {
                        self.emit_rows(&id, chunk, &cancel).await?;
                    }
                    for row in 0..decoder.num_rows() {
                        let decoded = decoder.decode_row(row, ordinal);
                        ordinal += 1;
                        if let Some(chunk) = assembler.push(decoded) {
                            self.emit_rows(&id, chunk, &cancel).await?;
                        }
                        if (row + 1) % YIELD_EVERY_ROWS == 0 {
                            tokio::task::yield_now().await;
                            if cancel.is_cancelled() {
                                return Err(SessionError::Cancelled.into());
                            }
                        }
                    }
                }
                ChunkEncoding::Arrow => {
                    for slice in split_batch(&batch, &self.config.chunk) {
                        let envelope = Outbound::Arrow {
                            id: id.clone(),
                            seq,
                            row_count: slice.num_rows(),
                            buffer: encode_ipc(&slice)?,
                        };
                        seq += 1;
                        self.emit(&id, envelope, &cancel).await?;
                    }
                }
            }
        }

        if let Some(chunk) = assembler.finish() {
            self.emit_rows(&id, chunk, &cancel).await?;
        }
        debug!(rows = ordinal, "result drained");
        Ok(())
    }

    async fn emit_rows(
        &self,
        id: &str,
        chunk: Chunk,
        cancel: &CancelToken,
    ) -> Result<(), WorkerError> {
        let envelope = Outbound::Json {
            id: id.to_string(),
            seq: chunk.seq,
            row_count: chunk.row_count(),
            buffer: chunk.to_json()?,
        };
        self.emit(id, envelope, cancel).await
    }

    async fn emit(
        &self,
        id: &str,
        envelope: Outbound,
        cancel: &CancelToken,
    ) -> Result<(), WorkerError> {
        if !self.governor.wait_for_capacity(id, cancel).await {
            return Err(SessionError::Cancelled.into());
        }
        self.governor.on_emit(id);
        debug!(outstanding = self.governor.outstanding(id), "chunk sent");
        self.outlet.send(envelope)?;
        Ok(())
    }

    /// Sends the terminal events for `id`: `cancelled` or `error` when the
    /// query did not complete, then always `done`.
    fn finish(&self, id: &str, outcome: Result<(), WorkerError>) {
        let cancelled = self
            .active()
            .remove(id)
            .is_some_and(|token| token.is_cancelled());
        self.governor.on_query_end(id);

        match outcome {
            _ if cancelled => {
                info!(query_id = id, "query cancelled");
                self.send(Outbound::Cancelled { id: id.to_string() });
            }
            Ok(()) => info!(query_id = id, "query complete"),
            Err(err) if err.is_cancelled() => {
                self.send(Outbound::Cancelled { id: id.to_string() });
            }
            Err(err) => {
                if matches!(err, WorkerError::Session(SessionError::Fatal { .. })) {
                    error!(query_id = id, error = %err, "query failed; engine torn down");
                } else {
                    info!(query_id = id, kind = err.kind(), error = %err, "query failed");
                }
                self.send(Outbound::error(Some(id), err.kind(), err.to_string()));
            }
        }
        self.send(Outbound::Done { id: id.to_string() });
    }

    /// Unknown ids are ignored; the query may already have finished.
    fn cancel(&self, id: &str) {
        let active = self.active();
        let Some(token) = active.get(id) else {
            debug!(query_id = id, "cancel for unknown query");
            return;
        };
        if token.cancel() {
            self.governor.request_drain(id);
            let interrupted = self.session.cancel(id);
            debug!(query_id = id, interrupted, "cancel requested");
        }
    }

    fn cancel_all(&self) {
        let ids: Vec<QueryId> = self.active().keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    fn send(&self, envelope: Outbound) {
        if let Err(err) = self.outlet.send(envelope) {
            debug!(error = %err, "reply dropped");
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<QueryId, CancelToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process worker driven over channels.
pub struct WorkerHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: WorkerConfig, session: EngineSession) -> Self {
        Self::spawn_with_probe(config, session, Box::new(ProcessMemory::new()))
    }

    pub fn spawn_with_probe(
        config: WorkerConfig,
        session: EngineSession,
        probe: Box<dyn MemoryProbe>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outlet, outbound) = Outlet::channel();
        let task = tokio::spawn(serve_with_probe(config, session, inbound_rx, outlet, probe));
        Self {
            inbound: inbound_tx,
            outbound,
            task,
        }
    }

    pub fn send(&self, envelope: Inbound) -> Result<(), TransportError> {
        self.inbound.send(envelope).map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Closes the inbound side and waits for the worker to wind down.
    /// Returns the replies it sent in the meantime.
    pub async fn shutdown(self) -> Vec<Outbound> {
        let Self {
            inbound,
            mut outbound,
            task,
        } = self;
        drop(inbound);
        if let Err(err) = task.await {
            error!(error = %err, "worker task failed");
        }
        let mut rest = Vec::new();
        while let Some(envelope) = outbound.recv().await {
            rest.push(envelope);
        }
        rest
    }
}

/// Serves framed envelopes from `reader`, replying on `writer`, until the
/// reader reaches end of stream.
pub async fn serve_framed<R, W>(
    config: WorkerConfig,
    session: EngineSession,
    reader: R,
    writer: W,
) -> Result<(), TransportError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let codec = CodecCell::new(config.transport.codec);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outlet, outbound_rx) = Outlet::channel();

    let reader = spawn_frame_reader(
        reader,
        config.transport.max_frame_bytes,
        codec.clone(),
        inbound_tx,
        outlet.clone(),
    );
    let writer = spawn_frame_writer(writer, codec, outbound_rx);

    serve(config, session, inbound_rx, outlet).await;

    tokio::task::spawn_blocking(move || {
        if reader.join().is_err() {
            error!("frame reader panicked");
        }
        match writer.join() {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    })
    .await
    .map_err(|_| TransportError::Closed)?
}
