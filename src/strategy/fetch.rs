//! Strategies that hand requests to a generic HTTP client.

use std::{io, sync::Arc};

use dynosaur::dynosaur;
use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use n0_future::StreamExt;
use reqwest::{Url, redirect};
use tracing::debug;

use super::{Capability, Handled, TransportStrategy};
use crate::{
    config::DnsServer,
    dns::DNS_MESSAGE_CONTENT_TYPE,
    error::GatewayError,
    message::{InboundRequest, OutboundResponse, RequestBody, ResponseBody},
    parse::{Destination, filter_request_headers},
    ws::UpgradedSocket,
};

/// A request for the generic HTTP client.
#[derive(Debug)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Follow redirects, or return them to the caller.
    pub follow_redirects: bool,
}

/// A generic HTTP client.
#[dynosaur(pub DynFetch = dyn(box) Fetch)]
pub trait Fetch: Send + Sync {
    fn fetch<'a>(
        &'a self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<OutboundResponse, GatewayError>> + Send + 'a;
}

/// [`Fetch`] backed by [`reqwest`].
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    follow: reqwest::Client,
    manual: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> Result<Self, GatewayError> {
        Ok(Self {
            follow: reqwest::Client::builder().build()?,
            manual: reqwest::Client::builder()
                .redirect(redirect::Policy::none())
                .build()?,
        })
    }
}

impl Fetch for ReqwestFetch {
    async fn fetch<'a>(&'a self, mut request: FetchRequest) -> Result<OutboundResponse, GatewayError> {
        let client = if request.follow_redirects {
            &self.follow
        } else {
            &self.manual
        };
        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers);
        builder = match request.body.known_len() {
            Some(0) => builder,
            Some(_) => builder.body(request.body.take_bytes().await?),
            None => {
                let stream = request
                    .body
                    .take_stream()?
                    .map(|chunk| chunk.map_err(|err| io::Error::other(err.to_string())));
                builder.body(reqwest::Body::wrap_stream(stream))
            }
        };
        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from));
        Ok(OutboundResponse::new(
            status,
            headers,
            ResponseBody::from_stream(body),
        ))
    }
}

/// Forwards requests to the destination over the generic HTTP client.
#[derive(derive_more::Debug)]
pub struct FetchStrategy {
    #[debug(skip)]
    fetch: Arc<DynFetch<'static>>,
    doh: DnsServer,
}

impl FetchStrategy {
    pub fn new(fetch: Arc<DynFetch<'static>>, doh: DnsServer) -> Self {
        Self { fetch, doh }
    }
}

impl TransportStrategy for FetchStrategy {
    async fn handle_http<'a>(
        &'a self,
        mut request: InboundRequest,
        destination: &'a Destination,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        let url = Url::parse(destination.as_str()).map_err(GatewayError::invalid_destination)?;
        let response = self
            .fetch
            .fetch(FetchRequest {
                method: request.method.clone(),
                url,
                headers: filter_request_headers(&request.headers),
                body: std::mem::take(&mut request.body),
                follow_redirects: true,
            })
            .await?;
        Ok(Handled::Done(response))
    }

    async fn open_websocket<'a>(
        &'a self,
        _headers: &'a HeaderMap,
        _destination: &'a Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        Ok(Handled::unsupported(
            Capability::WebSocket,
            "Fetch proxy does not support WebSocket",
        ))
    }

    async fn handle_dns<'a>(
        &'a self,
        request: InboundRequest,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        let response = fetch_dns_query(self.fetch.as_ref(), &self.doh, request).await?;
        Ok(Handled::Done(response))
    }
}

/// Sends a DNS query to the DoH server over the generic HTTP client.
pub(super) async fn fetch_dns_query(
    fetch: &DynFetch<'static>,
    server: &DnsServer,
    mut request: InboundRequest,
) -> Result<OutboundResponse, GatewayError> {
    let url = if server.port == 443 {
        format!("https://{}{}", server.hostname, server.path)
    } else {
        format!("https://{}:{}{}", server.hostname, server.port, server.path)
    };
    let url = Url::parse(&url).map_err(GatewayError::config)?;
    let mut headers = filter_request_headers(&request.headers);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(DNS_MESSAGE_CONTENT_TYPE));
    headers.insert(ACCEPT, HeaderValue::from_static(DNS_MESSAGE_CONTENT_TYPE));
    debug!(%url, "dns query over fetch");
    fetch
        .fetch(FetchRequest {
            method: request.method.clone(),
            url,
            headers,
            body: std::mem::take(&mut request.body),
            follow_redirects: true,
        })
        .await
}

/// Which relay service a [`RelayStrategy`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    ThirdParty,
    CloudProvider,
}

impl RelayKind {
    fn unconfigured(self) -> &'static str {
        match self {
            Self::ThirdParty => "Third party proxy URL is not configured",
            Self::CloudProvider => "Cloud provider URL is not configured",
        }
    }

    fn websocket_reason(self) -> &'static str {
        match self {
            Self::ThirdParty => "Third party proxy may not support WebSocket",
            Self::CloudProvider => "Cloud provider proxy may not support WebSocket",
        }
    }
}

/// Hands requests to an external relay as `{relay}?target={destination}`.
///
/// Redirects from the relay are returned to the client.
#[derive(derive_more::Debug)]
pub struct RelayStrategy {
    #[debug(skip)]
    fetch: Arc<DynFetch<'static>>,
    kind: RelayKind,
    relay_url: String,
}

impl RelayStrategy {
    pub fn third_party(fetch: Arc<DynFetch<'static>>, relay_url: impl Into<String>) -> Self {
        Self {
            fetch,
            kind: RelayKind::ThirdParty,
            relay_url: relay_url.into(),
        }
    }

    pub fn cloud_provider(fetch: Arc<DynFetch<'static>>, relay_url: impl Into<String>) -> Self {
        Self {
            fetch,
            kind: RelayKind::CloudProvider,
            relay_url: relay_url.into(),
        }
    }

    /// The relay URL with `target` set to `destination`, replacing any
    /// `target` parameter already present.
    fn relay_target(&self, destination: &Destination) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.relay_url).map_err(GatewayError::config)?;
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "target")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("target", destination.as_str());
        Ok(url)
    }
}

impl TransportStrategy for RelayStrategy {
    async fn handle_http<'a>(
        &'a self,
        mut request: InboundRequest,
        destination: &'a Destination,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        if self.relay_url.is_empty() {
            return Ok(Handled::Done(OutboundResponse::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                self.kind.unconfigured(),
            )));
        }
        let url = self.relay_target(destination)?;
        debug!(kind = ?self.kind, %url, "relaying");
        let response = self
            .fetch
            .fetch(FetchRequest {
                method: request.method.clone(),
                url,
                headers: filter_request_headers(&request.headers),
                body: std::mem::take(&mut request.body),
                follow_redirects: false,
            })
            .await?;
        Ok(Handled::Done(response))
    }

    async fn open_websocket<'a>(
        &'a self,
        _headers: &'a HeaderMap,
        _destination: &'a Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        Ok(Handled::unsupported(
            Capability::WebSocket,
            self.kind.websocket_reason(),
        ))
    }

    async fn handle_dns<'a>(
        &'a self,
        _request: InboundRequest,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        Ok(Handled::not_implemented(Capability::Dns))
    }
}
