//! Length-prefixed frames so RPCs can be exchanged over a byte stream.
//!
//! Each frame is a little-endian `u32` length followed by that many bytes.
//! `read_frame` yields `None` on a clean end-of-stream so connection loops
//! can terminate without treating hang-up as an error.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Requests and responses are small JSON
/// documents; anything near this size is garbage or abuse.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_LENGTH {
        bail!("frame of {} bytes exceeds the limit", data.len());
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LENGTH {
        bail!("frame of {len} bytes exceeds the limit");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.expect("writes");
        write_frame(&mut client, b"").await.expect("writes empty");
        drop(client);

        assert_eq!(
            read_frame(&mut server).await.expect("reads"),
            Some(b"hello".to_vec())
        );
        assert_eq!(read_frame(&mut server).await.expect("reads"), Some(vec![]));
        assert_eq!(read_frame(&mut server).await.expect("clean eof"), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let oversized = vec![0u8; MAX_FRAME_LENGTH + 1];
        assert!(write_frame(&mut client, &oversized).await.is_err());

        // A length prefix beyond the limit is refused before any payload
        // is read.
        tokio::io::AsyncWriteExt::write_u32_le(&mut client, (MAX_FRAME_LENGTH as u32) + 1)
            .await
            .expect("writes prefix");
        assert!(read_frame(&mut server).await.is_err());
    }
}
