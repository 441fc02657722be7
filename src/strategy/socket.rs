use std::sync::Arc;

use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{ACCEPT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
};
use n0_future::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{Capability, Handled, TransportStrategy, require_websocket};
use crate::{
    body::{BodyDecoder, BodyFraming},
    error::GatewayError,
    message::{InboundRequest, OutboundResponse, ResponseBody},
    parse::{Destination, ParsedHttpHead, encode_request_head, filter_request_headers},
    transport::{Connector, DynConnector},
    util::Prebuffered,
    ws::{UpgradedSocket, client_handshake},
};

/// Speaks HTTP/1.1 and WebSocket directly over a socket to the destination.
#[derive(derive_more::Debug)]
pub struct DirectSocket {
    #[debug(skip)]
    connector: Arc<DynConnector<'static>>,
}

impl DirectSocket {
    pub fn new(connector: Arc<DynConnector<'static>>) -> Self {
        Self { connector }
    }
}

impl TransportStrategy for DirectSocket {
    async fn handle_http<'a>(
        &'a self,
        request: InboundRequest,
        destination: &'a Destination,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        let stream = self
            .connector
            .open(destination.host(), destination.port(), destination.tls())
            .await?;
        debug!(%destination, "connected");
        let response = exchange_http(Prebuffered::new(stream), request, destination).await?;
        Ok(Handled::Done(response))
    }

    async fn open_websocket<'a>(
        &'a self,
        headers: &'a HeaderMap,
        destination: &'a Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        require_websocket(destination)?;
        let stream = self
            .connector
            .open(destination.host(), destination.port(), destination.tls())
            .await?;
        let socket = client_handshake(Prebuffered::new(stream), destination, headers).await?;
        Ok(Handled::Done(socket))
    }

    async fn handle_dns<'a>(
        &'a self,
        _request: InboundRequest,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        Ok(Handled::unsupported(
            Capability::Dns,
            "Socket proxy does not support DNS query handling. Please use DoH or DoT proxy.",
        ))
    }
}

/// Sends `request` over `stream` and returns the response with a lazily
/// decoded body.
///
/// Dropping the response body closes `stream`.
pub(super) async fn exchange_http<S>(
    mut stream: Prebuffered<S>,
    mut request: InboundRequest,
    destination: &Destination,
) -> Result<OutboundResponse, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut headers = filter_request_headers(&request.headers);
    let host = HeaderValue::from_str(&destination.host_header())
        .map_err(|err| GatewayError::invalid_destination(err))?;
    headers.insert(HOST, host);
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    let chunked = match (headers.contains_key(CONTENT_LENGTH), request.body.known_len()) {
        (true, _) | (false, Some(0)) => false,
        (false, Some(len)) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            false
        }
        (false, None) => {
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            true
        }
    };

    let head = encode_request_head(&request.method, destination.path_and_query(), &headers);
    stream.write_all(&head).await?;
    let mut body = request.body.take_stream()?;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        if chunked {
            stream
                .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                .await?;
            stream.write_all(&chunk).await?;
            stream.write_all(b"\r\n").await?;
        } else {
            stream.write_all(&chunk).await?;
        }
    }
    if chunked {
        stream.write_all(b"0\r\n\r\n").await?;
    }
    stream.flush().await?;

    let head = loop {
        let head = ParsedHttpHead::read(&mut stream).await?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(status = %head.status, "skipping interim response");
            continue;
        }
        break head;
    };
    let framing = if has_no_body(&request.method, head.status) {
        BodyFraming::Fixed(0)
    } else {
        head.framing()?
    };
    debug!(status = %head.status, ?framing, "response head");
    let body = BodyDecoder::new(stream, framing).into_stream();
    Ok(OutboundResponse {
        status: head.status,
        reason: Some(head.reason).filter(|reason| !reason.is_empty()),
        headers: head.headers,
        body: ResponseBody::from_stream(body),
    })
}

fn has_no_body(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Uri};
    use n0_future::stream;
    use n0_tracing_test::traced_test;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::message::RequestBody;

    async fn read_until(stream: &mut DuplexStream, marker: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(marker) {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        buf
    }

    fn request(method: Method, headers: HeaderMap, body: RequestBody) -> InboundRequest {
        InboundRequest::new(method, Uri::from_static("/"), headers, body)
    }

    #[tokio::test]
    #[traced_test]
    async fn streams_body_with_chunked_encoding() {
        let (client, mut origin) = tokio::io::duplex(4096);
        let destination = Destination::parse("http://origin.test:8080/upload?x=1").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gateway.test"));
        headers.insert("accept-encoding", HeaderValue::from_static("br"));
        let body = RequestBody::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
        ]));
        let origin = tokio::spawn(async move {
            let head = read_until(&mut origin, b"\r\n\r\n").await;
            let body = read_until(&mut origin, b"0\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n")
                .await
                .unwrap();
            (String::from_utf8(head).unwrap(), body, origin)
        });
        let response = exchange_http(
            Prebuffered::new(client),
            request(Method::POST, headers, body),
            &destination,
        )
        .await
        .unwrap();
        let (head, body, _origin) = origin.await.unwrap();
        assert!(head.starts_with("POST /upload?x=1 HTTP/1.1\r\n"));
        assert!(head.contains("host: origin.test:8080\r\n"));
        assert!(head.contains("accept-encoding: identity\r\n"));
        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert!(!head.contains("gateway.test"));
        assert_eq!(body, b"3\r\nabc\r\n5\r\ndefgh\r\n0\r\n\r\n");
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.reason.as_deref(), Some("Created"));
        assert_eq!(&response.body.collect().await.unwrap()[..], b"ok");
    }

    #[tokio::test]
    async fn buffered_body_gets_content_length() {
        let (client, mut origin) = tokio::io::duplex(4096);
        let destination = Destination::parse("https://origin.test/").unwrap();
        let origin = tokio::spawn(async move {
            let head = read_until(&mut origin, b"\r\n\r\n").await;
            let mut body = [0u8; 5];
            origin.read_exact(&mut body).await.unwrap();
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
                .await
                .unwrap();
            (String::from_utf8(head).unwrap(), body, origin)
        });
        let response = exchange_http(
            Prebuffered::new(client),
            request(
                Method::PUT,
                HeaderMap::new(),
                RequestBody::from_bytes(Bytes::from_static(b"hello")),
            ),
            &destination,
        )
        .await
        .unwrap();
        let (head, body, _origin) = origin.await.unwrap();
        assert!(head.contains("host: origin.test\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert_eq!(&body, b"hello");
        assert_eq!(&response.body.collect().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    #[traced_test]
    async fn interim_responses_are_skipped() {
        let (client, mut origin) = tokio::io::duplex(4096);
        let destination = Destination::parse("http://origin.test/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("expect", HeaderValue::from_static("100-continue"));
        let origin = tokio::spawn(async move {
            let head = read_until(&mut origin, b"\r\n\r\n").await;
            let mut body = [0u8; 4];
            origin.read_exact(&mut body).await.unwrap();
            origin
                .write_all(
                    b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </a>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
                )
                .await
                .unwrap();
            (String::from_utf8(head).unwrap(), origin)
        });
        let response = exchange_http(
            Prebuffered::new(client),
            request(
                Method::POST,
                headers,
                RequestBody::from_bytes(Bytes::from_static(b"data")),
            ),
            &destination,
        )
        .await
        .unwrap();
        let (head, _origin) = origin.await.unwrap();
        assert!(!head.contains("expect"));
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.get("link").is_none());
        assert_eq!(&response.body.collect().await.unwrap()[..], b"ok");
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let (client, mut origin) = tokio::io::duplex(4096);
        let destination = Destination::parse("http://origin.test/").unwrap();
        let origin = tokio::spawn(async move {
            read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n")
                .await
                .unwrap();
            origin
        });
        let response = exchange_http(
            Prebuffered::new(client),
            request(Method::HEAD, HeaderMap::new(), RequestBody::empty()),
            &destination,
        )
        .await
        .unwrap();
        assert_eq!(response.headers[CONTENT_LENGTH], "1000");
        assert!(response.body.collect().await.unwrap().is_empty());
        let _origin = origin.await.unwrap();
    }
}
