//! WebSocket client handshake over a raw stream, and the relay between an
//! accepted client connection and that stream.

use base64::{Engine, prelude::BASE64_STANDARD};
use http::{
    HeaderMap, HeaderValue, Method,
    header::{
        CONNECTION, HOST, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
};
use n0_error::e;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    error::GatewayError,
    parse::{
        Destination, MAX_HEAD_LEN, ParsedHttpHead, encode_request_head, filter_request_headers,
    },
    transport::BoxedStream,
    util::{CRLF, HEAD_TERMINATOR, Prebuffered, find_subsequence, resume_offset},
};

pub mod codec;
pub mod relay;

/// A stream that completed the WebSocket handshake.
pub struct UpgradedSocket<S = BoxedStream> {
    /// Bytes the destination sent right after its handshake response stay
    /// buffered and are decoded as frames.
    pub stream: Prebuffered<S>,
    /// `Sec-WebSocket-Protocol` selected by the destination.
    pub protocol: Option<HeaderValue>,
}

impl<S> std::fmt::Debug for UpgradedSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedSocket")
            .field("stream", &self.stream)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Returns a fresh `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Performs the client side of the upgrade handshake on `stream`.
///
/// Bytes already buffered in `stream` are treated as part of the response.
///
/// The forwarded request headers are filtered like for plain HTTP requests.
/// Extension negotiation is never forwarded since frames are relayed
/// uncompressed.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: Prebuffered<S>,
    destination: &Destination,
    request_headers: &HeaderMap,
) -> Result<UpgradedSocket<S>, GatewayError> {
    let mut headers = filter_request_headers(request_headers);
    headers.remove(SEC_WEBSOCKET_EXTENSIONS);
    let host = HeaderValue::from_str(&destination.host_header())
        .map_err(|err| GatewayError::invalid_destination(err))?;
    let key = HeaderValue::from_str(&generate_key())
        .map_err(|err| GatewayError::invalid_destination(err))?;
    headers.insert(HOST, host);
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers.insert(SEC_WEBSOCKET_KEY, key);

    let head = encode_request_head(&Method::GET, destination.path_and_query(), &headers);
    reader.write_all(&head).await?;
    reader.flush().await?;

    let mut scanned = 0;
    loop {
        if let Some(pos) = find_subsequence(reader.buffer(), HEAD_TERMINATOR, scanned) {
            let head = &reader.buffer()[..pos];
            let line_end = find_subsequence(head, CRLF, 0).unwrap_or(head.len());
            let status_line = String::from_utf8_lossy(&head[..line_end]);
            if !(status_line.contains("101") && status_line.contains("Switching Protocols")) {
                let response = String::from_utf8_lossy(head).into_owned();
                return Err(e!(GatewayError::HandshakeFailed { response }));
            }
            let body_offset = pos + HEAD_TERMINATOR.len();
            let protocol = ParsedHttpHead::parse(&reader.buffer()[..body_offset])
                .ok()
                .flatten()
                .and_then(|head| head.headers.get(SEC_WEBSOCKET_PROTOCOL).cloned());
            debug!(%destination, ?protocol, "websocket handshake complete");
            reader.discard(body_offset);
            return Ok(UpgradedSocket {
                stream: reader,
                protocol,
            });
        }
        scanned = resume_offset(reader.len(), HEAD_TERMINATOR.len());
        if reader.len() > MAX_HEAD_LEN || reader.buffer_more().await? == 0 {
            let response = String::from_utf8_lossy(reader.buffer()).into_owned();
            return Err(e!(GatewayError::HandshakeFailed { response }));
        }
    }
}

#[cfg(test)]
mod tests {
    use n0_tracing_test::traced_test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn read_request_head(stream: &mut tokio::io::DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn keys_are_sixteen_random_bytes() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[tokio::test]
    #[traced_test]
    async fn handshake_keeps_trailing_frame_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let destination = Destination::parse("wss://echo.example:8443/chat?room=1").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-extensions", HeaderValue::from_static("permessage-deflate"));
        headers.insert("x-token", HeaderValue::from_static("abc"));
        let server = tokio::spawn(async move {
            let head = read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi")
                .await
                .unwrap();
            (head, server)
        });
        let mut socket = client_handshake(Prebuffered::new(client), &destination, &headers)
            .await
            .unwrap();
        let (head, _server) = server.await.unwrap();
        assert!(head.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(head.contains("host: echo.example:8443\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));
        assert!(head.contains("sec-websocket-version: 13\r\n"));
        assert!(head.contains("x-token: abc\r\n"));
        assert!(!head.contains("permessage-deflate"));
        assert!(socket.protocol.is_none());
        socket.stream.fill_to(4).await.unwrap();
        assert_eq!(socket.stream.buffer(), b"\x81\x02hi");
    }

    #[tokio::test]
    async fn handshake_reports_selected_protocol() {
        let (client, mut server) = tokio::io::duplex(1024);
        let destination = Destination::parse("ws://example.com/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", HeaderValue::from_static("chat, superchat"));
        let server = tokio::spawn(async move {
            let head = read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Protocol: chat\r\n\r\n")
                .await
                .unwrap();
            (head, server)
        });
        let socket = client_handshake(Prebuffered::new(client), &destination, &headers)
            .await
            .unwrap();
        let (head, _server) = server.await.unwrap();
        assert!(head.contains("sec-websocket-protocol: chat, superchat\r\n"));
        assert_eq!(socket.protocol.unwrap(), "chat");
    }

    #[tokio::test]
    async fn non_upgrade_response_fails() {
        let (client, mut server) = tokio::io::duplex(1024);
        let destination = Destination::parse("ws://example.com/").unwrap();
        let server = tokio::spawn(async move {
            read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            server
        });
        let err = client_handshake(Prebuffered::new(client), &destination, &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::HandshakeFailed { ref response, .. } if response.contains("403")));
        let _server = server.await.unwrap();
    }
}
