//! Multipart encoding for attachment-bearing events
//!
//! An event with a binary attachment goes on the wire as
//! `multipart/form-data`: a JSON metadata part followed by one binary part,
//! streamed so attachments of unbounded size never sit in memory whole.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::observer::AttachmentSource;

const ATTACHMENT_READ_CHUNK: usize = 16 * 1024;

/// Boundary token for one stream's multipart body
pub(crate) fn boundary(stream_id: &str) -> String {
    format!("avs-transport-{stream_id}")
}

/// `Content-Type` header value for a multipart body with `boundary`
pub(crate) fn content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

fn part_header(boundary: &str, name: &str, content_type: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(b"--");
    buf.put_slice(boundary.as_bytes());
    buf.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
    buf.put_slice(name.as_bytes());
    buf.put_slice(b"\"\r\nContent-Type: ");
    buf.put_slice(content_type.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

fn closing(boundary: &str) -> Bytes {
    Bytes::from(format!("\r\n--{boundary}--\r\n"))
}

/// Stream the multipart body for `json` plus one attachment into `tx`
///
/// Closing `tx` ends the request body. A read failure on the attachment
/// aborts the body early; the server sees a truncated part and fails the
/// request, which surfaces to the caller as its terminal status.
pub(crate) async fn stream_multipart(
    boundary: String,
    json: Bytes,
    attachment_name: String,
    mut reader: AttachmentSource,
    tx: mpsc::Sender<Bytes>,
) {
    let metadata = part_header(&boundary, "metadata", "application/json; charset=UTF-8");
    if tx.send(metadata).await.is_err() {
        return;
    }
    if tx.send(json).await.is_err() {
        return;
    }
    let attachment = {
        let mut buf = BytesMut::new();
        buf.put_slice(b"\r\n");
        buf.extend_from_slice(&part_header(
            &boundary,
            &attachment_name,
            "application/octet-stream",
        ));
        buf.freeze()
    };
    if tx.send(attachment).await.is_err() {
        return;
    }

    loop {
        let mut chunk = BytesMut::with_capacity(ATTACHMENT_READ_CHUNK);
        match reader.read_buf(&mut chunk).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(chunk.freeze()).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                warn!(%error, "attachment read failed, truncating body");
                return;
            }
        }
    }

    let _ = tx.send(closing(&boundary)).await;
}
