//! Request and response values passed between the listener and the strategies.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use http::{
    HeaderMap, HeaderValue, Method, StatusCode, Uri,
    header::{CONTENT_TYPE, UPGRADE},
};
use n0_error::e;
use n0_future::{Stream, StreamExt, stream};

use crate::error::GatewayError;

/// A boxed stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send + 'static>>;

enum BodyInner {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

/// A request body that can be consumed once.
///
/// Take a replayable copy with [`RequestBody::duplicate`] before handing the
/// body to a consumer.
pub struct RequestBody {
    inner: Option<BodyInner>,
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => write!(f, "RequestBody(consumed)"),
            Some(BodyInner::Empty) => write!(f, "RequestBody(empty)"),
            Some(BodyInner::Full(bytes)) => write!(f, "RequestBody({} bytes)", bytes.len()),
            Some(BodyInner::Stream(_)) => write!(f, "RequestBody(stream)"),
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            inner: Some(BodyInner::Empty),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            inner: Some(BodyInner::Full(bytes)),
        }
    }

    pub fn from_stream(
        stream: impl Stream<Item = Result<Bytes, GatewayError>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Some(BodyInner::Stream(Box::pin(stream))),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns the body length if it is known without reading the body.
    pub fn known_len(&self) -> Option<u64> {
        match &self.inner {
            Some(BodyInner::Empty) => Some(0),
            Some(BodyInner::Full(bytes)) => Some(bytes.len() as u64),
            Some(BodyInner::Stream(_)) | None => None,
        }
    }

    /// Returns an independent copy of this body.
    ///
    /// A streaming body is read to the end first; both copies are then
    /// backed by the same buffered bytes.
    pub async fn duplicate(&mut self) -> Result<RequestBody, GatewayError> {
        match self.inner.take() {
            None => Err(e!(GatewayError::BodyConsumed)),
            Some(BodyInner::Empty) => {
                self.inner = Some(BodyInner::Empty);
                Ok(Self::empty())
            }
            Some(BodyInner::Full(bytes)) => {
                self.inner = Some(BodyInner::Full(bytes.clone()));
                Ok(Self::from_bytes(bytes))
            }
            Some(BodyInner::Stream(stream)) => {
                let bytes = collect_stream(stream).await?;
                *self = Self::from_bytes(bytes.clone());
                Ok(Self::from_bytes(bytes))
            }
        }
    }

    /// Takes the body as a stream, marking it consumed.
    pub fn take_stream(&mut self) -> Result<BodyStream, GatewayError> {
        match self.inner.take() {
            None => Err(e!(GatewayError::BodyConsumed)),
            Some(BodyInner::Empty) => Ok(Box::pin(stream::empty())),
            Some(BodyInner::Full(bytes)) => Ok(Box::pin(stream::once(Ok(bytes)))),
            Some(BodyInner::Stream(stream)) => Ok(stream),
        }
    }

    /// Takes the body and reads it to the end, marking it consumed.
    pub async fn take_bytes(&mut self) -> Result<Bytes, GatewayError> {
        match self.inner.take() {
            None => Err(e!(GatewayError::BodyConsumed)),
            Some(BodyInner::Empty) => Ok(Bytes::new()),
            Some(BodyInner::Full(bytes)) => Ok(bytes),
            Some(BodyInner::Stream(stream)) => collect_stream(stream).await,
        }
    }
}

async fn collect_stream(mut stream: BodyStream) -> Result<Bytes, GatewayError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// A request received by the gateway.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl InboundRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: RequestBody) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Returns a replayable copy of this request.
    ///
    /// Must run before the body is read; fails with
    /// [`GatewayError::BodyConsumed`] afterwards.
    pub async fn duplicate(&mut self) -> Result<InboundRequest, GatewayError> {
        Ok(Self {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: self.body.duplicate().await?,
        })
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        is_websocket_upgrade(&self.headers)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Whether `headers` carry `Upgrade: websocket`.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

/// A response body. Dropping it closes the transport it streams from.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "ResponseBody(empty)"),
            Self::Full(bytes) => write!(f, "ResponseBody({} bytes)", bytes.len()),
            Self::Stream(_) => write!(f, "ResponseBody(stream)"),
        }
    }
}

impl ResponseBody {
    pub fn from_stream(
        stream: impl Stream<Item = Result<Bytes, GatewayError>> + Send + 'static,
    ) -> Self {
        Self::Stream(Box::pin(stream))
    }

    pub fn into_stream(self) -> BodyStream {
        match self {
            Self::Empty => Box::pin(stream::empty()),
            Self::Full(bytes) => Box::pin(stream::once(Ok(bytes))),
            Self::Stream(stream) => stream,
        }
    }

    /// Reads the whole body.
    pub async fn collect(self) -> Result<Bytes, GatewayError> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Full(bytes) => Ok(bytes),
            Self::Stream(stream) => collect_stream(stream).await,
        }
    }

    /// Stops reading the body and closes its transport.
    pub fn cancel(self) {
        drop(self)
    }
}

/// A response produced by a strategy.
#[derive(Debug)]
pub struct OutboundResponse {
    pub status: StatusCode,
    /// Reason phrase as received from the destination, if any.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl OutboundResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            reason: None,
            headers,
            body,
        }
    }

    /// A plain-text response.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(
            status,
            headers,
            ResponseBody::Full(Bytes::from(message.into())),
        )
    }

    /// A plain-text error response naming where the error happened.
    pub fn error(status: StatusCode, context: &str, err: &GatewayError) -> Self {
        Self::text(status, format!("Error {context}: {err:#}"))
    }

    /// A DNS answer with content type `application/dns-message`.
    pub fn dns_message(answer: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(crate::dns::DNS_MESSAGE_CONTENT_TYPE),
        );
        Self::new(StatusCode::OK, headers, ResponseBody::Full(answer))
    }
}
