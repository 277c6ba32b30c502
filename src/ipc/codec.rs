//! Multipart frame codec for stream transports.
//!
//! Frame format:
//! ```text
//! ┌────────────┬──────────┬────────────┬──────────┬─────┐
//! │ count (4B) │ len (4B) │ part bytes │ len (4B) │ ... │
//! │ u32 BE     │ u32 BE   │            │ u32 BE   │     │
//! └────────────┴──────────┴────────────┴──────────┴─────┘
//! ```
//! `max_frame_bytes` caps the sum of all part lengths of one frame.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn invalid(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// Read one multipart frame from the stream.
///
/// Returns `None` on clean EOF before the frame starts.
pub async fn read_multipart<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let count = u32::from_be_bytes(count_buf);
    if count == 0 {
        return Err(invalid("Frame has no parts".to_string()));
    }

    let mut total: u64 = 0;
    let mut parts = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);

        total += u64::from(len);
        if total > u64::from(max_frame_bytes) {
            return Err(invalid(format!("Frame too large: over {} bytes", max_frame_bytes)));
        }

        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }

    Ok(Some(parts))
}

/// Write one multipart frame to the stream.
pub async fn write_multipart<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    parts: &[Vec<u8>],
) -> std::io::Result<()> {
    let count = u32::try_from(parts.len())
        .map_err(|_| invalid(format!("Too many parts: {}", parts.len())))?;
    writer.write_all(&count.to_be_bytes()).await?;
    for part in parts {
        let len = u32::try_from(part.len())
            .map_err(|_| invalid(format!("Part too large: {} bytes", part.len())))?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_round_trip_preserves_part_boundaries() {
        let parts = vec![b"id".to_vec(), Vec::new(), b"<IDS|MSG>".to_vec(), vec![0xAB; 1000]];
        let mut buf = Vec::new();
        write_multipart(&mut buf, &parts).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_multipart(&mut cursor, 1 << 20).await.unwrap().unwrap();
        assert_eq!(decoded, parts);

        // Clean EOF afterwards
        assert!(read_multipart(&mut cursor, 1 << 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        write_multipart(&mut buf, &[vec![0u8; 64], vec![0u8; 64]]).await.unwrap();

        let err = read_multipart(&mut Cursor::new(buf), 100).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_zero_part_frame_is_rejected() {
        let buf = 0u32.to_be_bytes().to_vec();
        let err = read_multipart(&mut Cursor::new(buf), 100).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_multipart(&mut buf, &[b"hello".to_vec()]).await.unwrap();
        buf.truncate(buf.len() - 2);

        assert!(read_multipart(&mut Cursor::new(buf), 100).await.is_err());
    }
}
