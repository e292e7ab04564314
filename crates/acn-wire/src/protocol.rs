//! Framed I/O and the request/response exchanges built on it.
//!
//! Each ACN stream carries a short exchange: one request message followed by
//! one reply (`Status` or `LookupResponse`). The initiator helpers live next
//! to the responder helpers so both sides of an exchange read together.
//! Responder helpers answer malformed input with the matching error status
//! before returning the error to the caller.

use crate::message::*;

use acn_types::{AcnError, AgentRecord, Envelope, Status, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: String, remote: String },
    #[error("Unexpected payload: expected {expected}, got {got}")]
    UnexpectedPayload {
        expected: &'static str,
        got: &'static str,
    },
    #[error("Envelope decode failed: {0}")]
    Decode(String),
    /// The counterparty answered with an error status.
    #[error("Remote status {0}")]
    Status(Status),
    #[error(transparent)]
    Acn(#[from] AcnError),
}

impl WireError {
    /// Status code reported to the counterparty or the caller for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            WireError::Json(_) => StatusCode::ErrorSerialization,
            WireError::VersionMismatch { .. } => StatusCode::ErrorUnsupportedVersion,
            WireError::UnexpectedPayload { .. } => StatusCode::ErrorUnexpectedPayload,
            WireError::Decode(_) => StatusCode::ErrorDecode,
            WireError::Status(status) => status.code,
            WireError::Acn(e) => e.status_code(),
            WireError::Io(_) | WireError::ConnectionClosed | WireError::MessageTooLarge { .. } => {
                StatusCode::ErrorGeneric
            }
        }
    }

    /// Convert into a status suitable for replying or returning to an agent.
    pub fn to_status(&self) -> Status {
        match self {
            WireError::Status(status) => status.clone(),
            other => Status::error(other.status_code(), other.to_string()),
        }
    }
}

impl From<Status> for WireError {
    fn from(status: Status) -> Self {
        WireError::Status(status)
    }
}

/// Maximum single message size (3 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 3 * 1024 * 1024;

/// Write a length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: body.len() as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&encode_frame(body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::ConnectionClosed),
        Err(e) => Err(WireError::Io(e)),
    }
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &AcnMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)?;
    write_frame(writer, &body).await
}

/// Read a framed message and check its protocol version.
pub async fn read_message<R>(reader: &mut R) -> Result<AcnMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader).await?;
    let msg = decode_message(&body)?;
    if msg.version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION.to_string(),
            remote: msg.version,
        });
    }
    Ok(msg)
}

/// Reply with a status message.
pub async fn send_status<W>(writer: &mut W, status: Status) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, &AcnMessage::status(status)).await
}

pub async fn send_success<W>(writer: &mut W) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    send_status(writer, Status::success()).await
}

// ---------------------------------------------------------------------------
// Responder side
// ---------------------------------------------------------------------------

/// Read the request that opens an exchange.
///
/// Malformed JSON is answered with `ERROR_SERIALIZATION` and a foreign
/// protocol version with `ERROR_UNSUPPORTED_VERSION`. Transport failures are
/// returned without a reply.
pub async fn read_request<S>(stream: &mut S) -> Result<AcnMessage, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_message(stream).await {
        Ok(msg) => Ok(msg),
        Err(e @ (WireError::Json(_) | WireError::VersionMismatch { .. })) => {
            reply_error(stream, &e).await;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Send the status matching `err`, logging (not propagating) write failures.
pub async fn reply_error<W>(writer: &mut W, err: &WireError)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = send_status(writer, err.to_status()).await {
        debug!("ACN: failed to report {} to counterparty: {}", err.status_code(), e);
    }
}

/// Read a `Register` request.
pub async fn read_registration<S>(stream: &mut S) -> Result<AgentRecord, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = read_request(stream).await?;
    match msg.payload {
        AcnPayload::Register { record } => Ok(record),
        other => Err(unexpected(stream, "register", other.kind()).await),
    }
}

/// Read a `LookupRequest` and return the requested address.
pub async fn read_lookup_request<S>(stream: &mut S) -> Result<String, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = read_request(stream).await?;
    match msg.payload {
        AcnPayload::LookupRequest { agent_address } => Ok(agent_address),
        other => Err(unexpected(stream, "lookup_request", other.kind()).await),
    }
}

/// Read an `Envelope` message and decode the embedded envelope.
///
/// An undecodable envelope is answered with `ERROR_DECODE`.
pub async fn read_envelope<S>(stream: &mut S) -> Result<(AgentRecord, Envelope), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = read_request(stream).await?;
    match msg.payload {
        AcnPayload::Envelope { record, envelope } => match Envelope::from_bytes(&envelope) {
            Ok(envelope) => Ok((record, envelope)),
            Err(e) => {
                let err = WireError::Decode(e.to_string());
                reply_error(stream, &err).await;
                Err(err)
            }
        },
        other => Err(unexpected(stream, "envelope", other.kind()).await),
    }
}

async fn unexpected<W>(writer: &mut W, expected: &'static str, got: &'static str) -> WireError
where
    W: AsyncWrite + Unpin,
{
    let err = WireError::UnexpectedPayload { expected, got };
    reply_error(writer, &err).await;
    err
}

// ---------------------------------------------------------------------------
// Initiator side
// ---------------------------------------------------------------------------

/// Read a `Status` reply.
pub async fn read_status<R>(reader: &mut R) -> Result<Status, WireError>
where
    R: AsyncRead + Unpin,
{
    let msg = read_message(reader).await?;
    match msg.payload {
        AcnPayload::Status { status } => Ok(status),
        other => Err(WireError::UnexpectedPayload {
            expected: "status",
            got: other.kind(),
        }),
    }
}

/// Read a `Status` reply and turn an error status into [`WireError::Status`].
pub async fn expect_success<R>(reader: &mut R) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let status = read_status(reader).await?;
    if status.is_success() {
        Ok(())
    } else {
        Err(WireError::Status(status))
    }
}

/// Register `record` over a freshly opened register stream.
pub async fn register<S>(stream: &mut S, record: AgentRecord) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &AcnMessage::register(record)).await?;
    expect_success(stream).await
}

/// Ask the counterparty for the record of `address`.
pub async fn lookup<S>(stream: &mut S, address: &str) -> Result<AgentRecord, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &AcnMessage::lookup_request(address)).await?;
    let msg = read_message(stream).await?;
    match msg.payload {
        AcnPayload::LookupResponse { record } => Ok(record),
        AcnPayload::Status { status } => Err(WireError::Status(status)),
        other => Err(WireError::UnexpectedPayload {
            expected: "lookup_response",
            got: other.kind(),
        }),
    }
}

/// Deliver an envelope together with the sender's record and await the status.
pub async fn deliver_envelope<S>(
    stream: &mut S,
    record: AgentRecord,
    envelope: &Envelope,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &AcnMessage::envelope(record, envelope)?).await?;
    expect_success(stream).await
}
