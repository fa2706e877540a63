//! Length-delimited frame codec.
//!
//! Every frame is a `u32` little-endian payload length followed by the
//! bincode-encoded payload. Reads return `Ok(None)` on a clean EOF at
//! a frame boundary; an EOF mid-frame is an IO error. Payload decoding
//! is separate from frame reading so callers can skip a malformed
//! payload without losing frame synchronization.

use crate::{WireError, WireResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Serialize a value and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame: usize) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(value).map_err(WireError::Encode)?;
    write_frame_bytes(writer, &payload, max_frame).await
}

/// Write an already-encoded payload as one frame.
pub async fn write_frame_bytes<W>(writer: &mut W, payload: &[u8], max_frame: usize) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_frame {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame's payload bytes, or `None` on clean EOF.
pub async fn read_frame_bytes<R>(reader: &mut R, max_frame: usize) -> WireResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > max_frame {
        return Err(WireError::FrameTooLarge { len, max: max_frame });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Decode a frame payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> WireResult<T> {
    bincode::deserialize(payload).map_err(WireError::Decode)
}

/// Read and decode one frame, or `None` on clean EOF.
pub async fn read_frame<R, T>(reader: &mut R, max_frame: usize) -> WireResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame_bytes(reader, max_frame).await? {
        Some(payload) => Ok(Some(decode(&payload)?)),
        None => Ok(None),
    }
}
