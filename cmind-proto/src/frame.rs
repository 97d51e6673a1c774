//! Length-prefixed framing for the gateway socket.
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! exactly that many payload bytes. A zero-length frame is the explicit
//! end-of-stream marker, not an error. Framing errors are fatal to the
//! connection that produced them, never to the process.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size indicate a corrupt header or a misbehaving peer
/// and tear down the connection.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    /// The stream ended before a full 4-byte length header was read.
    #[error("short frame header")]
    ShortHeader,
    /// The stream ended before `length` payload bytes were read.
    #[error("truncated frame payload")]
    TruncatedPayload,
    #[error("frame length {0} exceeds {MAX_FRAME_LEN} byte limit")]
    Oversized(u32),
    #[error("frame I/O error")]
    Io(#[from] io::Error),
}

/// One decoded frame: either a payload to hand to the message layer, or the
/// peer's end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Payload(Vec<u8>),
    EndOfStream,
}

/// Prefix `payload` with its 4-byte big-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Read exactly one frame, looping on short reads until the header and the
/// full payload have arrived.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::ShortHeader
        } else {
            FrameError::Io(e)
        }
    })?;

    let length = u32::from_be_bytes(header);
    if length == 0 {
        return Ok(Frame::EndOfStream);
    }
    if length > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(length));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::TruncatedPayload
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(Frame::Payload(payload))
}

/// Write `payload` as one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    Ok(())
}

/// Write the zero-length end-of-stream marker.
pub async fn write_end_of_stream<W>(writer: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u32.to_be_bytes()).await?;
    Ok(())
}
