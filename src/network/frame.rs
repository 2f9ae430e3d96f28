//! Length-prefixed framing: `[u32 little-endian length][UTF-8 JSON payload]`.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload (10 MiB).
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
pub const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame length {0} (allowed 1..={max})", max = MAX_MESSAGE_BYTES)]
    InvalidLength(i64),
    #[error("refusing to send an empty frame")]
    EmptyPayload,
    #[error("payload of {0} bytes exceeds the {max} byte frame limit", max = MAX_MESSAGE_BYTES)]
    PayloadTooLarge(usize),
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// The peer closed the stream, possibly in the middle of a frame.
    EndOfStream,
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<ReadOutcome, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    if read_full(reader, &mut prefix).await? < LENGTH_PREFIX_BYTES {
        return Ok(ReadOutcome::EndOfStream);
    }

    // Signed on purpose: a peer writing a negative length is a protocol violation, not a huge frame.
    let length = i32::from_le_bytes(prefix);
    if length <= 0 || length as usize > MAX_MESSAGE_BYTES {
        return Err(FrameError::InvalidLength(i64::from(length)));
    }

    let mut payload = vec![0u8; length as usize];
    if read_full(reader, &mut payload).await? < payload.len() {
        return Ok(ReadOutcome::EndOfStream);
    }

    Ok(ReadOutcome::Frame(payload))
}

/// Reads until `buf` is full or the stream ends. Returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
