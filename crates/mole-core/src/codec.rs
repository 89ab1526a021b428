//! Length-prefixed CBOR framing for the mole control connection.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{MoleError, MoleResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from the wire (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a serializable value as a bare CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> MoleResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> MoleResult<Vec<u8>> {
    let payload = cbor_encode(value)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> MoleResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Read one frame from `r` and return its undecoded payload.
///
/// Returns `ConnectionClosed` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> MoleResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(MoleError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(MoleError::Protocol(format!("frame too large: {len} bytes")));
    }

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Encode `value` and write it as one frame.
pub async fn write_frame<W, T>(w: &mut W, value: &T) -> MoleResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    w.write_all(&frame).await?;
    Ok(())
}
