//! Wire Framing
//!
//! `[u32 little-endian length][payload]` frames over a raw byte stream.
//!
//! Uses Sans-IO pattern: payload encoding/decoding is separated from the
//! async read/write helpers for testability.
//!
//! Two payload formats share the framing:
//! - [`WireFormat::Json`]: `{"type": 0|1, "list": [entries]}` (push-pull)
//! - [`WireFormat::Binary`]: `[u16 little-endian message type][bincode body]`
//!   with Begin=1, Exchange=2, End=3 (digest exchange)

use crate::replication::types::{Digest, Entry, Message, MessageKind};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Binary message-type header size in bytes.
pub const TYPE_HEADER_LEN: usize = 2;

const PUSH_TYPE: u8 = 0;
const PUSH_REPLY_TYPE: u8 = 1;

const BEGIN_TYPE: u16 = 1;
const EXCHANGE_TYPE: u16 = 2;
const END_TYPE: u16 = 3;

/// Payload encoding spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Binary,
}

/// Framing errors. Any of these ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("no frame for {0:?}")]
    Idle(Duration),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("payload of {0} bytes is too short for a message header")]
    Truncated(usize),
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid binary payload: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("{kind} messages cannot be carried by the {format:?} format")]
    Unsupported { kind: MessageKind, format: WireFormat },
}

impl FrameError {
    /// Whether this is a stream failure rather than a malformed payload.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FrameError::Closed | FrameError::Io(_) | FrameError::Timeout | FrameError::Idle(_)
        )
    }
}

/// Read-side limits applied to every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Largest accepted payload
    pub max_frame_len: usize,
    /// Deadline for the length prefix of the next frame
    pub idle_timeout: Duration,
    /// Deadline for the rest of a frame once its prefix arrived
    pub io_timeout: Duration,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
            idle_timeout: Duration::from_secs(300),
            io_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct EntryListRef<'a> {
    #[serde(rename = "type")]
    kind: u8,
    list: &'a [Entry],
}

#[derive(Deserialize)]
struct EntryList {
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default)]
    list: Vec<Entry>,
}

// ==================== Sans-IO Functions ====================

/// Encode a message payload (no length prefix).
pub fn encode_payload(msg: &Message, format: WireFormat) -> Result<Vec<u8>, FrameError> {
    match (format, msg) {
        (WireFormat::Json, Message::Push(list)) => Ok(serde_json::to_vec(&EntryListRef {
            kind: PUSH_TYPE,
            list,
        })?),
        (WireFormat::Json, Message::PushReply(list)) => Ok(serde_json::to_vec(&EntryListRef {
            kind: PUSH_REPLY_TYPE,
            list,
        })?),
        (WireFormat::Binary, Message::Begin(digests)) => binary_payload(BEGIN_TYPE, digests),
        (WireFormat::Binary, Message::Exchange { push, pull }) => {
            binary_payload(EXCHANGE_TYPE, &(push, pull))
        }
        (WireFormat::Binary, Message::End(entries)) => binary_payload(END_TYPE, entries),
        (format, msg) => Err(FrameError::Unsupported {
            kind: msg.kind(),
            format,
        }),
    }
}

fn binary_payload<T: Serialize + ?Sized>(kind: u16, body: &T) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(body)?;
    let mut payload = Vec::with_capacity(TYPE_HEADER_LEN + body.len());
    payload.put_u16_le(kind);
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decode a message payload (no length prefix).
pub fn decode_payload(data: &[u8], format: WireFormat) -> Result<Message, FrameError> {
    match format {
        WireFormat::Json => {
            let doc: EntryList = serde_json::from_slice(data)?;
            match doc.kind {
                PUSH_TYPE => Ok(Message::Push(doc.list)),
                PUSH_REPLY_TYPE => Ok(Message::PushReply(doc.list)),
                other => Err(FrameError::UnknownMessageType(other as u16)),
            }
        }
        WireFormat::Binary => {
            if data.len() < TYPE_HEADER_LEN {
                return Err(FrameError::Truncated(data.len()));
            }
            let kind = u16::from_le_bytes([data[0], data[1]]);
            let body = &data[TYPE_HEADER_LEN..];
            match kind {
                BEGIN_TYPE => Ok(Message::Begin(bincode::deserialize::<Vec<Digest>>(body)?)),
                EXCHANGE_TYPE => {
                    let (push, pull) = bincode::deserialize::<(Vec<Entry>, Vec<Digest>)>(body)?;
                    Ok(Message::Exchange { push, pull })
                }
                END_TYPE => Ok(Message::End(bincode::deserialize::<Vec<Entry>>(body)?)),
                other => Err(FrameError::UnknownMessageType(other)),
            }
        }
    }
}

/// Encode a message as a complete length-prefixed frame.
pub fn encode_frame(msg: &Message, format: WireFormat) -> Result<BytesMut, FrameError> {
    let payload = encode_payload(msg, format)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.put_u32_le(len);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the length prefix.
pub fn decode_length(buf: &[u8; LENGTH_PREFIX_LEN]) -> usize {
    u32::from_le_bytes(*buf) as usize
}

/// Decode one complete frame held in memory.
pub fn decode_frame(
    frame: &[u8],
    format: WireFormat,
    max_frame_len: usize,
) -> Result<Message, FrameError> {
    let prefix: [u8; LENGTH_PREFIX_LEN] = frame
        .get(..LENGTH_PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or(FrameError::Truncated(frame.len()))?;
    let len = decode_length(&prefix);
    if len > max_frame_len {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame_len,
        });
    }
    let payload = &frame[LENGTH_PREFIX_LEN..];
    if payload.len() != len {
        return Err(FrameError::Truncated(payload.len()));
    }
    decode_payload(payload, format)
}

// ==================== Async I/O ====================

/// Read and decode the next frame.
///
/// Waiting for the first byte of the length prefix is bounded by
/// `idle_timeout` and reported as [`FrameError::Idle`]; the rest of the frame
/// by `io_timeout`. Only an EOF before any prefix byte is reported as
/// [`FrameError::Closed`].
pub async fn read_frame<R>(
    reader: &mut R,
    format: WireFormat,
    limits: &FrameLimits,
) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match tokio::time::timeout(limits.idle_timeout, reader.read_u8()).await {
        Ok(Ok(first)) => len_buf[0] = first,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(FrameError::Idle(limits.idle_timeout)),
    }
    // EOF from here on is a partial frame, not a clean close
    match tokio::time::timeout(limits.io_timeout, reader.read_exact(&mut len_buf[1..])).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(FrameError::Timeout),
    }

    let len = decode_length(&len_buf);
    if len > limits.max_frame_len {
        return Err(FrameError::TooLarge {
            len,
            max: limits.max_frame_len,
        });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        match tokio::time::timeout(limits.io_timeout, reader.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(FrameError::Timeout),
        }
    }

    decode_payload(&payload, format)
}

/// Encode and write one frame, bounded by `timeout`.
pub async fn write_frame<W>(
    writer: &mut W,
    msg: &Message,
    format: WireFormat,
    timeout: Duration,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg, format)?;
    match tokio::time::timeout(timeout, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => Err(FrameError::Timeout),
    }
}
