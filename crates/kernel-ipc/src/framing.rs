//! Length-prefixed framing for channel envelopes crossing a process boundary.
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload bytes]
//! ```
//!
//! Frames towards the client carry gateway output and may be large, up to
//! [`MAX_FRAME_SIZE`]. Frames from the client are small control JSON and are
//! read with the [`MAX_CONTROL_FRAME_SIZE`] cap, checked before any
//! allocation happens.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size for data frames: 100 MiB.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Maximum frame size for client control frames: 64 KiB.
pub const MAX_CONTROL_FRAME_SIZE: usize = 64 * 1024;

/// Error type for frame I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Send a length-prefixed frame of at most `max_size` bytes. An oversized
/// payload is refused before anything is written.
pub async fn send_frame_with_limit<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    max_size: usize,
) -> Result<(), FrameError> {
    if data.len() > max_size {
        return Err(FrameError::TooLarge {
            len: data.len(),
            max: max_size,
        });
    }
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Send a length-prefixed frame (up to 100 MiB).
pub async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), FrameError> {
    send_frame_with_limit(writer, data, MAX_FRAME_SIZE).await
}

/// Receive a length-prefixed frame with a caller-specified size limit.
/// Returns `None` on clean disconnect (EOF).
async fn recv_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(FrameError::TooLarge { len, max: max_size });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Receive a length-prefixed frame (up to 100 MiB).
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    recv_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

/// Receive a frame with the control size limit (64 KiB).
pub async fn recv_control_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    recv_frame_with_limit(reader, MAX_CONTROL_FRAME_SIZE).await
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), FrameError> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await
}

/// Receive and deserialize a JSON-encoded length-prefixed frame.
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, FrameError> {
    match recv_frame(reader).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Receive and deserialize a JSON control frame (up to 64 KiB).
pub async fn recv_json_control_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, FrameError> {
    match recv_control_frame(reader).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}
