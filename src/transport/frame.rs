//! Wire framing: short ASCII tag + length-prefixed body
//!
//! Layout: `[u8 tag-len][tag][u32 big-endian body-len][body]`.
//! The tag distinguishes message kinds on the wire ("msg" or "query");
//! the body is a JSON envelope, encrypted when the link is secured.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum frame body size
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024; // 16 MiB

/// Maximum wire tag length
const MAX_TAG_LEN: usize = 16;

/// Write one frame
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    tag: &str,
    body: &[u8],
) -> Result<()> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN || !tag.is_ascii() {
        return Err(Error::FrameCorrupt(format!("invalid wire tag: {tag:?}")));
    }
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::FrameCorrupt(format!(
            "frame too large: {} bytes (max {})",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    writer.write_u8(tag.len() as u8).await?;
    writer.write_all(tag.as_bytes()).await?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one frame, returning its tag and body
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<(String, Vec<u8>)> {
    let tag_len = reader.read_u8().await? as usize;
    if tag_len == 0 || tag_len > MAX_TAG_LEN {
        return Err(Error::FrameCorrupt(format!("bad tag length: {tag_len}")));
    }

    let mut tag_buf = vec![0u8; tag_len];
    reader.read_exact(&mut tag_buf).await?;
    let tag = String::from_utf8(tag_buf)
        .map_err(|_| Error::FrameCorrupt("non-UTF8 wire tag".to_string()))?;
    if !tag.is_ascii() {
        return Err(Error::FrameCorrupt(format!("non-ASCII wire tag: {tag:?}")));
    }

    let body_len = reader.read_u32().await?;
    if body_len > MAX_FRAME_SIZE {
        return Err(Error::FrameCorrupt(format!(
            "frame too large: {body_len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok((tag, body))
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, "msg", b"{\"kind\":\"PING\"}")
            .await
            .unwrap();

        let (tag, body) = read_frame(&mut server).await.unwrap();
        assert_eq!(tag, "msg");
        assert_eq!(body, b"{\"kind\":\"PING\"}");
    }

    #[tokio::test]
    async fn test_query_tag() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, "query", b"body").await.unwrap();
        let (tag, body) = read_frame(&mut server).await.unwrap();
        assert_eq!(tag, "query");
        assert_eq!(body, b"body");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_frame(&mut client, "msg", b"").await.unwrap();
        let (tag, body) = read_frame(&mut server).await.unwrap();
        assert_eq!(tag, "msg");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_frames_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        for i in 0..5u8 {
            write_frame(&mut client, "msg", &[i; 3]).await.unwrap();
        }
        for i in 0..5u8 {
            let (_, body) = read_frame(&mut server).await.unwrap();
            assert_eq!(body, vec![i; 3]);
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_tag() {
        let (mut client, _server) = tokio::io::duplex(64);

        assert!(write_frame(&mut client, "", b"x").await.is_err());
        assert!(
            write_frame(&mut client, "a-tag-way-too-long-for-the-wire", b"x")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_read_rejects_oversize_length() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Hand-craft a header claiming a body beyond the cap
        client.write_u8(3).await.unwrap();
        client.write_all(b"msg").await.unwrap();
        client.write_u32(MAX_FRAME_SIZE + 1).await.unwrap();

        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_stream_errors() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_u8(3).await.unwrap();
        client.write_all(b"msg").await.unwrap();
        client.write_u32(100).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }
}
