//! Envelope types and the length-prefixed frame transport.
//!
//! In-process hosts exchange [`Inbound`] and [`Outbound`] values over tokio
//! channels; chunk buffers move into the envelope and the producer keeps no
//! handle to them. The stdio transport encodes each envelope into a frame,
//! which copies the buffer.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use arrow::datatypes::Field;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireCodec {
    #[default]
    Msgpack,
    Json,
}

impl WireCodec {
    fn to_tag(self) -> u8 {
        match self {
            WireCodec::Msgpack => 0,
            WireCodec::Json => 1,
        }
    }

    fn from_tag(tag: u8) -> Self {
        if tag == 1 {
            WireCodec::Json
        } else {
            WireCodec::Msgpack
        }
    }
}

/// Codec used for replies: the codec of the last decoded inbound frame.
#[derive(Clone, Debug)]
pub struct CodecCell(Arc<AtomicU8>);

impl CodecCell {
    pub fn new(initial: WireCodec) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_tag())))
    }

    pub fn get(&self) -> WireCodec {
        WireCodec::from_tag(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, codec: WireCodec) {
        self.0.store(codec.to_tag(), Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkEncoding {
    #[default]
    Json,
    Arrow,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Inbound {
    Init {
        #[serde(default)]
        source_candidates: Vec<String>,
    },
    Run {
        id: String,
        sql: String,
        #[serde(default)]
        encoding: ChunkEncoding,
    },
    Ack {
        id: String,
    },
    Cancel {
        id: String,
    },
    Describe {
        id: String,
        sql: String,
    },
    RegisterFile {
        id: String,
        file_name: String,
        #[serde(with = "payload_bytes")]
        file_buffer: Vec<u8>,
    },
    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl From<&Field> for FieldInfo {
    fn from(field: &Field) -> Self {
        Self {
            name: field.name().clone(),
            data_type: field.data_type().to_string(),
            nullable: field.is_nullable(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Outbound {
    Inited {
        source: String,
    },
    Json {
        id: String,
        seq: u64,
        row_count: usize,
        #[serde(with = "payload_bytes")]
        buffer: Vec<u8>,
    },
    Arrow {
        id: String,
        seq: u64,
        row_count: usize,
        #[serde(with = "payload_bytes")]
        buffer: Vec<u8>,
    },
    Cancelled {
        id: String,
    },
    Done {
        id: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        kind: String,
        message: String,
    },
    FileRegistered {
        id: String,
    },
    Schema {
        id: String,
        fields: Vec<FieldInfo>,
    },
    ResetDone,
}

impl Outbound {
    pub fn error(id: Option<&str>, kind: &str, message: impl Into<String>) -> Self {
        Outbound::Error {
            id: id.map(str::to_string),
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Query id this envelope belongs to, if any.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Outbound::Json { id, .. }
            | Outbound::Arrow { id, .. }
            | Outbound::Cancelled { id }
            | Outbound::Done { id }
            | Outbound::FileRegistered { id }
            | Outbound::Schema { id, .. } => Some(id),
            Outbound::Error { id, .. } => id.as_deref(),
            Outbound::Inited { .. } | Outbound::ResetDone => None,
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, Outbound::Json { .. } | Outbound::Arrow { .. })
    }
}

/// Binary payloads: raw bytes for MessagePack, base64 text for JSON.
/// Decoding accepts either form.
pub mod payload_bytes {
    use std::fmt;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64.encode(bytes))
        } else {
            serde_bytes::serialize(bytes, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(PayloadVisitor)
    }

    struct PayloadVisitor;

    impl<'de> Visitor<'de> for PayloadVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte buffer or base64 text")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Vec<u8>, E> {
            BASE64.decode(value).map_err(E::custom)
        }

        fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Vec<u8>, E> {
            Ok(value.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(value)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("invalid envelope: {0}")]
    Malformed(String),
    #[error("msgpack encode failed: {0}")]
    Msgpack(#[from] rmp_serde::encode::Error),
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads one frame; `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err.into());
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            size,
            limit: max_frame_bytes,
        });
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    let size = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// MessagePack is tried first, then JSON.
pub fn decode_inbound(bytes: &[u8]) -> Result<(Inbound, WireCodec), TransportError> {
    if let Ok(envelope) = rmp_serde::from_slice::<Inbound>(bytes) {
        return Ok((envelope, WireCodec::Msgpack));
    }
    serde_json::from_slice::<Inbound>(bytes)
        .map(|envelope| (envelope, WireCodec::Json))
        .map_err(|err| TransportError::Malformed(err.to_string()))
}

pub fn encode_outbound(envelope: &Outbound, codec: WireCodec) -> Result<Vec<u8>, TransportError> {
    match codec {
        WireCodec::Msgpack => Ok(rmp_serde::to_vec_named(envelope)?),
        WireCodec::Json => Ok(serde_json::to_vec(envelope)?),
    }
}

/// Encodes inbound envelopes, for hosts and tests driving a framed worker.
pub fn encode_inbound(envelope: &Inbound, codec: WireCodec) -> Result<Vec<u8>, TransportError> {
    match codec {
        WireCodec::Msgpack => Ok(rmp_serde::to_vec_named(envelope)?),
        WireCodec::Json => Ok(serde_json::to_vec(envelope)?),
    }
}

pub fn decode_outbound(bytes: &[u8], codec: WireCodec) -> Result<Outbound, TransportError> {
    match codec {
        WireCodec::Msgpack => {
            rmp_serde::from_slice(bytes).map_err(|err| TransportError::Malformed(err.to_string()))
        }
        WireCodec::Json => {
            serde_json::from_slice(bytes).map_err(|err| TransportError::Malformed(err.to_string()))
        }
    }
}

/// Sending half of the worker's reply channel.
#[derive(Clone, Debug)]
pub struct Outlet {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outlet {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, envelope: Outbound) -> Result<(), TransportError> {
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }
}

/// Decodes frames from `reader` on a dedicated thread until end of stream.
/// Undecodable frames are answered with a `protocol` error and skipped; an
/// oversized or truncated frame ends the stream.
pub fn spawn_frame_reader<R>(
    mut reader: R,
    max_frame_bytes: usize,
    codec: CodecCell,
    inbound: mpsc::UnboundedSender<Inbound>,
    outlet: Outlet,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || loop {
        let frame = match read_frame(&mut reader, max_frame_bytes) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("input closed");
                break;
            }
            Err(err) => {
                warn!(error = %err, "unreadable frame; closing input");
                let _ = outlet.send(Outbound::error(None, "protocol", err.to_string()));
                break;
            }
        };
        match decode_inbound(&frame) {
            Ok((envelope, wire)) => {
                codec.set(wire);
                if inbound.send(envelope).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, bytes = frame.len(), "undecodable frame");
                let _ = outlet.send(Outbound::error(None, "protocol", err.to_string()));
            }
        }
    })
}

/// Writes replies as frames on a dedicated thread, in the codec held by
/// `codec` at the time each envelope is written.
pub fn spawn_frame_writer<W>(
    mut writer: W,
    codec: CodecCell,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> thread::JoinHandle<Result<(), TransportError>>
where
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        while let Some(envelope) = outbound.blocking_recv() {
            let encoded = match encode_outbound(&envelope, codec.get()) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(error = %err, query_id = envelope.query_id(), "failed to encode reply");
                    fallback_frame(&envelope, &err)
                }
            };
            write_frame(&mut writer, &encoded)?;
        }
        Ok(())
    })
}

/// Base64 form used in JSON envelopes.
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Plain JSON stand-in for a reply the codec rejected. Terminal events keep
/// their meaning; anything else becomes an `encode` error for the same query.
fn fallback_frame(envelope: &Outbound, err: &TransportError) -> Vec<u8> {
    let value = match envelope {
        Outbound::Done { id } => json!({ "type": "done", "id": id }),
        Outbound::Cancelled { id } => json!({ "type": "cancelled", "id": id }),
        other => {
            let mut value = json!({
                "type": "error",
                "kind": "encode",
                "message": format!("failed to encode reply: {err}"),
            });
            if let Some(id) = other.query_id() {
                value["id"] = json!(id);
            }
            value
        }
    };
    value.to_string().into_bytes()
}
