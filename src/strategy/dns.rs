use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, warn};

use super::{Capability, Handled, TransportStrategy, fetch::{DynFetch, fetch_dns_query}};
use crate::{
    config::DnsServer,
    dns::{DNS_MESSAGE_CONTENT_TYPE, doh_exchange, dot_exchange},
    error::GatewayError,
    message::{InboundRequest, OutboundResponse, RequestBody},
    parse::Destination,
    transport::{Connector, DynConnector},
    ws::UpgradedSocket,
};

/// Answers DNS queries over DNS-over-HTTPS.
///
/// Queries go over a raw TLS socket first. If that fails the query is
/// retried over the generic HTTP client.
#[derive(derive_more::Debug)]
pub struct DohStrategy {
    #[debug(skip)]
    connector: Arc<DynConnector<'static>>,
    #[debug(skip)]
    fetch: Arc<DynFetch<'static>>,
    server: DnsServer,
}

impl DohStrategy {
    pub fn new(
        connector: Arc<DynConnector<'static>>,
        fetch: Arc<DynFetch<'static>>,
        server: DnsServer,
    ) -> Self {
        Self {
            connector,
            fetch,
            server,
        }
    }

    /// Resolves `query`, sent with the method and headers of `request`.
    async fn resolve(
        &self,
        mut request: InboundRequest,
        query: Bytes,
    ) -> Result<OutboundResponse, GatewayError> {
        match self.exchange(&query).await {
            Ok(answer) => Ok(OutboundResponse::dns_message(answer)),
            Err(err) => {
                warn!(server = %self.server.hostname, "DoH socket exchange failed, retrying over fetch: {err:#}");
                request.body = RequestBody::from_bytes(query);
                fetch_dns_query(self.fetch.as_ref(), &self.server, request).await
            }
        }
    }

    async fn exchange(&self, query: &[u8]) -> Result<Bytes, GatewayError> {
        let stream = self
            .connector
            .open(&self.server.hostname, self.server.port, true)
            .await?;
        let answer = doh_exchange(stream, &self.server.hostname, &self.server.path, query).await?;
        debug!(len = answer.len(), "DoH answer");
        Ok(answer)
    }
}

impl TransportStrategy for DohStrategy {
    async fn handle_http<'a>(
        &'a self,
        request: InboundRequest,
        _destination: &'a Destination,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        self.handle_dns(request).await
    }

    async fn open_websocket<'a>(
        &'a self,
        _headers: &'a HeaderMap,
        _destination: &'a Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        Ok(Handled::unsupported(
            Capability::WebSocket,
            "DoH proxy does not support WebSocket",
        ))
    }

    async fn handle_dns<'a>(
        &'a self,
        mut request: InboundRequest,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        if !is_dns_message(&request) {
            return Ok(Handled::Done(OutboundResponse::text(
                StatusCode::BAD_REQUEST,
                "This is a DNS proxy. Please use a DoH client.",
            )));
        }
        let query = request.body.take_bytes().await?;
        let response = self.resolve(request, query).await?;
        Ok(Handled::Done(response))
    }
}

/// Answers DNS queries over DNS-over-TLS, falling back to [`DohStrategy`].
#[derive(derive_more::Debug)]
pub struct DotStrategy {
    #[debug(skip)]
    connector: Arc<DynConnector<'static>>,
    server: DnsServer,
    doh: DohStrategy,
}

impl DotStrategy {
    pub fn new(connector: Arc<DynConnector<'static>>, server: DnsServer, doh: DohStrategy) -> Self {
        Self {
            connector,
            server,
            doh,
        }
    }

    async fn exchange(&self, query: &[u8]) -> Result<Bytes, GatewayError> {
        let stream = self
            .connector
            .open(&self.server.hostname, self.server.port, true)
            .await?;
        let answer = dot_exchange(stream, query).await?;
        debug!(len = answer.len(), "DoT answer");
        Ok(answer)
    }
}

impl TransportStrategy for DotStrategy {
    async fn handle_http<'a>(
        &'a self,
        request: InboundRequest,
        _destination: &'a Destination,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        self.handle_dns(request).await
    }

    async fn open_websocket<'a>(
        &'a self,
        _headers: &'a HeaderMap,
        _destination: &'a Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        Ok(Handled::unsupported(
            Capability::WebSocket,
            "DoT proxy does not support WebSocket",
        ))
    }

    async fn handle_dns<'a>(
        &'a self,
        mut request: InboundRequest,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        if !is_dns_message(&request) {
            return Ok(Handled::Done(OutboundResponse::text(
                StatusCode::BAD_REQUEST,
                "This is a DNS proxy. Please use a DoT client.",
            )));
        }
        let query = request.body.take_bytes().await?;
        let response = match self.exchange(&query).await {
            Ok(answer) => OutboundResponse::dns_message(answer),
            Err(err) => {
                warn!(server = %self.server.hostname, "DoT exchange failed, retrying over DoH: {err:#}");
                self.doh.resolve(request, query).await?
            }
        };
        Ok(Handled::Done(response))
    }
}

fn is_dns_message(request: &InboundRequest) -> bool {
    request.method == Method::POST
        && request.content_type().is_some_and(|value| {
            value
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(DNS_MESSAGE_CONTENT_TYPE))
        })
}

#[cfg(test)]
mod tests {
    use std::io;

    use http::{HeaderMap, HeaderValue, Uri, header::CONTENT_TYPE};
    use n0_tracing_test::traced_test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        config::StrategyConfig,
        strategy::fetch::tests::RecordingFetch,
        transport::{BoxedStream, Connector},
    };

    /// Serves one scripted DoT answer per connection.
    struct DotServer;

    impl Connector for DotServer {
        async fn open<'a>(&'a self, _host: &'a str, _port: u16, tls: bool) -> io::Result<BoxedStream> {
            assert!(tls);
            let (client, mut server) = tokio::io::duplex(512);
            tokio::spawn(async move {
                let mut len = [0u8; 2];
                server.read_exact(&mut len).await?;
                let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
                server.read_exact(&mut query).await?;
                query[2] |= 0x80;
                server.write_all(&len).await?;
                server.write_all(&query).await?;
                io::Result::Ok(server)
            });
            Ok(Box::new(client))
        }

        async fn start_tls<'a>(&'a self, _host: &'a str, stream: BoxedStream) -> io::Result<BoxedStream> {
            Ok(stream)
        }
    }

    /// Refuses every connection.
    struct Unreachable;

    impl Connector for Unreachable {
        async fn open<'a>(&'a self, host: &'a str, port: u16, _tls: bool) -> io::Result<BoxedStream> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{host}:{port} refused"),
            ))
        }

        async fn start_tls<'a>(&'a self, _host: &'a str, stream: BoxedStream) -> io::Result<BoxedStream> {
            Ok(stream)
        }
    }

    fn dns_request(content_type: &'static str, query: &'static [u8]) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        InboundRequest::new(
            Method::POST,
            Uri::from_static("/tok/dns/dot"),
            headers,
            RequestBody::from_bytes(Bytes::from_static(query)),
        )
    }

    fn dot(connector: Arc<DynConnector<'static>>, fetch: &RecordingFetch) -> DotStrategy {
        let config = StrategyConfig::default();
        let doh = DohStrategy::new(connector.clone(), fetch.boxed(), config.doh);
        DotStrategy::new(connector, config.dot, doh)
    }

    #[tokio::test]
    #[traced_test]
    async fn dot_answers_over_socket() {
        let fetch = RecordingFetch::default();
        let strategy = dot(DynConnector::new_arc(DotServer), &fetch);
        let query = b"\xab\xcd\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00";
        let response = strategy
            .handle_dns(dns_request(DNS_MESSAGE_CONTENT_TYPE, query))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers[CONTENT_TYPE], DNS_MESSAGE_CONTENT_TYPE);
        let answer = response.body.collect().await.unwrap();
        assert_eq!(answer.len(), query.len());
        assert_eq!(answer[2], 0x81);
        assert!(fetch.requests().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn unreachable_servers_fall_back_to_fetch() {
        let fetch = RecordingFetch::default();
        let strategy = dot(DynConnector::new_arc(Unreachable), &fetch);
        let response = strategy
            .handle_dns(dns_request("application/dns-message; charset=binary", b"\x01\x02"))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status, StatusCode::OK);
        let requests = fetch.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.as_str(), "https://dns.google/dns-query");
        assert_eq!(&requests[0].body[..], b"\x01\x02");
    }

    #[tokio::test]
    async fn rejects_non_dns_requests() {
        let fetch = RecordingFetch::default();
        let strategy = dot(DynConnector::new_arc(Unreachable), &fetch);
        let response = strategy
            .handle_dns(dns_request("text/plain", b"hello"))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            &response.body.collect().await.unwrap()[..],
            b"This is a DNS proxy. Please use a DoT client."
        );

        let config = StrategyConfig::default();
        let doh = DohStrategy::new(DynConnector::new_arc(Unreachable), fetch.boxed(), config.doh);
        let mut request = dns_request(DNS_MESSAGE_CONTENT_TYPE, b"");
        request.method = Method::GET;
        let destination = Destination::parse("https://example.com/").unwrap();
        let response = doh
            .handle_http(request, &destination)
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            &response.body.collect().await.unwrap()[..],
            b"This is a DNS proxy. Please use a DoH client."
        );
        assert!(fetch.requests().is_empty());
    }
}
