//! TCP framing for router messages.
//!
//! Each part of a multi-part message is written as:
//!
//! ```text
//! [u8 flags][u32 BE: len][bytes of len]
//! ```
//!
//! Bit 0 of `flags` is set when more parts of the same message follow. A
//! connection opens with a single-part greeting carrying the sender's identity
//! (possibly empty).

use crate::config::TransportConfig;
use crate::error::{NrpcError, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const FLAG_MORE: u8 = 0x01;

/// Read one part. Returns `None` on clean EOF before the part header.
pub async fn read_part<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<(Bytes, bool)>> {
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let flags = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(NrpcError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            TransportConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some((Bytes::from(payload), flags & FLAG_MORE != 0)))
}

/// Write one part without flushing.
pub async fn write_part<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    part: &[u8],
    more: bool,
) -> Result<()> {
    if part.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(NrpcError::protocol(format!(
            "frame size {} exceeds maximum {}",
            part.len(),
            TransportConfig::MAX_FRAME_SIZE
        )));
    }
    let flags = if more { FLAG_MORE } else { 0 };
    writer.write_u8(flags).await?;
    writer.write_all(&(part.len() as u32).to_be_bytes()).await?;
    writer.write_all(part).await?;
    Ok(())
}

/// Read parts until the final one. Returns `None` on clean EOF between messages.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<Bytes>>> {
    let mut parts = Vec::new();
    loop {
        match read_part(reader).await? {
            Some((part, more)) => {
                parts.push(part);
                if !more {
                    return Ok(Some(parts));
                }
            }
            None if parts.is_empty() => return Ok(None),
            None => {
                return Err(NrpcError::protocol(
                    "connection closed in the middle of a message",
                ))
            }
        }
    }
}

/// Write all parts of a message and flush.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    parts: &[Bytes],
) -> Result<()> {
    let last = parts.len().saturating_sub(1);
    for (i, part) in parts.iter().enumerate() {
        write_part(writer, part, i < last).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_read_write_roundtrip() {
        let parts = vec![
            Bytes::from_static(b"Echo.Ping"),
            Bytes::from_static(b"{\"n\":1}"),
        ];
        let mut buf = Vec::new();
        write_message(&mut buf, &parts).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_message(&mut cursor).await.unwrap();
        assert_eq!(read_back, Some(parts));
        assert_eq!(read_message(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_more_flag_is_set_on_all_but_last() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &[Bytes::from_static(b"a"), Bytes::from_static(b"b")],
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (first, more) = read_part(&mut cursor).await.unwrap().unwrap();
        assert_eq!((&first[..], more), (&b"a"[..], true));
        let (second, more) = read_part(&mut cursor).await.unwrap().unwrap();
        assert_eq!((&second[..], more), (&b"b"[..], false));
    }

    #[tokio::test]
    async fn test_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_part(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_message_is_protocol_error() {
        let mut buf = Vec::new();
        write_part(&mut buf, b"first", true).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(err.is_protocol_fatal());
    }

    #[tokio::test]
    async fn test_oversized_part_is_rejected() {
        let huge_len = (TransportConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = vec![0u8];
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_part(&mut cursor).await.is_err());
    }
}
