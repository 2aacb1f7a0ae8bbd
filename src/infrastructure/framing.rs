use crate::domain::errors::TransportError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame size on both bridge sockets.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Write one length-prefixed UTF-8 JSON frame: a big-endian u32 byte count
/// followed by the JSON payload.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)
        .map_err(|e| TransportError::Malformed(format!("encode failed: {e}")))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::Malformed(format!(
            "outbound frame of {} bytes exceeds {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await.map_err(io_disconnect)?;
    writer.write_all(&payload).await.map_err(io_disconnect)?;
    writer.flush().await.map_err(io_disconnect)?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
///
/// An oversized frame is drained from the socket and reported as
/// `Malformed`; the stream stays consistent so the caller can keep reading.
/// I/O failures and EOF map to `Disconnected`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(io_disconnect)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_BYTES {
        drain(reader, len).await?;
        return Err(TransportError::Malformed(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_BYTES} byte limit, discarded"
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(io_disconnect)?;

    serde_json::from_slice(&payload)
        .map_err(|e| TransportError::Malformed(format!("decode failed: {e}")))
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R, mut remaining: usize) -> Result<(), TransportError> {
    let mut sink = [0u8; 8192];
    while remaining > 0 {
        let take = remaining.min(sink.len());
        reader
            .read_exact(&mut sink[..take])
            .await
            .map_err(io_disconnect)?;
        remaining -= take;
    }
    Ok(())
}

fn io_disconnect(_: std::io::Error) -> TransportError {
    TransportError::Disconnected
}
