//! Length-prefixed framing for plugin callbacks
//!
//! ```text
//! ┌──────────────────┬─────────────────────┐
//! │ Length (4 bytes) │ JSON body (N bytes) │
//! │  big-endian u32  │                     │
//! └──────────────────┴─────────────────────┘
//! ```
//!
//! The receiver answers each frame with a single [`ACK`] byte.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Callbacks are tiny; anything larger is garbage
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

pub const ACK: u8 = 0x06;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame too large: {0} bytes (max {})", MAX_FRAME_SIZE)]
    TooLarge(usize),
    #[error("Empty frame")]
    Empty,
    #[error("Malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unexpected acknowledgement byte: {0:#04x}")]
    BadAck(u8),
}

/// Read one frame body
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len as usize));
    }
    if len == 0 {
        return Err(FrameError::Empty);
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write `message` as one JSON frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(body.len()));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameError> {
    Ok(serde_json::from_slice(body)?)
}

pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FrameError> {
    writer.write_all(&[ACK]).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), FrameError> {
    let byte = reader.read_u8().await?;
    if byte != ACK {
        return Err(FrameError::BadAck(byte));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { seq: 7 }).await.unwrap();

        let body = br#"{"seq":7}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], body);

        let mut cursor = Cursor::new(buf);
        let read = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decode::<Ping>(&read).unwrap(), Ping { seq: 7 });
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let mut buf = (MAX_FRAME_SIZE + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let result = read_frame(&mut Cursor::new(buf)).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_rejects_empty_frame() {
        let buf = 0u32.to_be_bytes().to_vec();
        let result = read_frame(&mut Cursor::new(buf)).await;
        assert!(matches!(result, Err(FrameError::Empty)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{\"se");
        let result = read_frame(&mut Cursor::new(buf)).await;
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_decode_malformed() {
        let result = decode::<Ping>(b"not json");
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_ack() {
        let mut buf = Vec::new();
        write_ack(&mut buf).await.unwrap();
        read_ack(&mut Cursor::new(buf)).await.unwrap();

        let result = read_ack(&mut Cursor::new(vec![0u8])).await;
        assert!(matches!(result, Err(FrameError::BadAck(0))));
    }
}
