//! DNS message framing for DNS-over-HTTPS and DNS-over-TLS exchanges.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{
    error::GatewayError,
    util::{HEAD_TERMINATOR, Prebuffered, find_subsequence},
};

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Prefixes `query` with its big-endian u16 length.
pub fn frame_dot_query(query: &[u8]) -> Result<Bytes, GatewayError> {
    let len = u16::try_from(query.len()).map_err(|_| {
        GatewayError::dns_framing(format!("query of {} bytes is too long", query.len()))
    })?;
    let mut buf = BytesMut::with_capacity(query.len() + 2);
    buf.put_u16(len);
    buf.put_slice(query);
    Ok(buf.freeze())
}

/// Extracts a length-prefixed DNS message from the front of `buf`.
///
/// Returns `None` until the prefix and the whole message are present.
pub fn unframe_dot_response(buf: &[u8]) -> Option<Bytes> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    buf.get(2..2 + len).map(Bytes::copy_from_slice)
}

/// Serializes the DoH POST request for `query`.
pub fn encode_doh_request(host: &str, path: &str, query: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + query.len());
    buf.put_slice(format!("POST {path} HTTP/1.1\r\n").as_bytes());
    buf.put_slice(format!("Host: {host}\r\n").as_bytes());
    buf.put_slice(format!("Content-Type: {DNS_MESSAGE_CONTENT_TYPE}\r\n").as_bytes());
    buf.put_slice(format!("Accept: {DNS_MESSAGE_CONTENT_TYPE}\r\n").as_bytes());
    buf.put_slice(format!("Content-Length: {}\r\n", query.len()).as_bytes());
    buf.put_slice(b"Connection: close\r\n\r\n");
    buf.put_slice(query);
    buf.freeze()
}

/// Returns the bytes after the response head.
pub fn extract_doh_answer(response: &[u8]) -> Result<Bytes, GatewayError> {
    let pos = find_subsequence(response, HEAD_TERMINATOR, 0)
        .ok_or_else(|| GatewayError::dns_framing("DoH response has no header terminator"))?;
    Ok(Bytes::copy_from_slice(
        &response[pos + HEAD_TERMINATOR.len()..],
    ))
}

/// Sends a DoH query over `stream` and reads the answer until the server closes.
pub async fn doh_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    host: &str,
    path: &str,
    query: &[u8],
) -> Result<Bytes, GatewayError> {
    let mut stream = Prebuffered::new(stream);
    stream
        .write_all(&encode_doh_request(host, path, query))
        .await?;
    stream.flush().await?;
    let response = stream.read_remaining().await?;
    trace!(len = response.len(), "doh response");
    extract_doh_answer(&response)
}

/// Sends a DoT query over `stream` and reads exactly one answer.
pub async fn dot_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    query: &[u8],
) -> Result<Bytes, GatewayError> {
    let framed = frame_dot_query(query)?;
    let mut stream = Prebuffered::new(stream);
    stream.write_all(&framed).await?;
    stream.flush().await?;
    loop {
        if let Some(answer) = unframe_dot_response(stream.buffer()) {
            trace!(len = answer.len(), "dot response");
            return Ok(answer);
        }
        if stream.buffer_more().await? == 0 {
            return Err(GatewayError::dns_framing(format!(
                "DoT stream ended after {} bytes",
                stream.len()
            )));
        }
    }
}
