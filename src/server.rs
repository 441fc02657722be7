//! HTTP/1.1 listener that feeds inbound requests to the [`Gateway`].

use std::{convert::Infallible, io, sync::Arc};

use bytes::Bytes;
use http::{
    HeaderValue, StatusCode,
    header::{
        CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
    },
};
use http_body_util::{BodyExt, Empty, StreamBody, combinators::UnsyncBoxBody};
use hyper::{
    Request, Response,
    body::{Body, Frame, Incoming},
    ext::ReasonPhrase,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use n0_future::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{handshake::derive_accept_key, protocol::Role},
};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    config::StrategyConfig,
    error::GatewayError,
    gateway::Gateway,
    message::{InboundRequest, OutboundResponse, RequestBody, is_websocket_upgrade},
    parse::strip_hop_by_hop,
    router::{Route, route},
    ws::relay::relay,
};

type HyperBody = UnsyncBoxBody<Bytes, io::Error>;

/// Accepts connections on `listener` and serves each on its own task.
///
/// Runs until accepting fails. Dropping the future cancels all connection
/// tasks.
pub async fn serve(
    listener: TcpListener,
    gateway: Gateway,
    config: Arc<StrategyConfig>,
) -> io::Result<()> {
    let cancel_token = CancellationToken::new();
    let _cancel_guard = cancel_token.clone().drop_guard();
    let mut id = 0u64;
    loop {
        let (stream, client_addr) = listener.accept().await?;
        let gateway = gateway.clone();
        let config = config.clone();
        tokio::spawn(
            cancel_token
                .child_token()
                .run_until_cancelled_owned(async move {
                    debug!(%client_addr, "accepted connection");
                    let service = service_fn(move |request| {
                        let gateway = gateway.clone();
                        let config = config.clone();
                        async move { Ok::<_, Infallible>(handle(&gateway, &config, request).await) }
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        warn!("connection failed: {err:#}");
                    }
                })
                .instrument(error_span!("conn", id)),
        );
        id += 1;
    }
}

async fn handle(
    gateway: &Gateway,
    config: &StrategyConfig,
    request: Request<Incoming>,
) -> Response<HyperBody> {
    let route = route(request.uri(), config);
    debug!(method = %request.method(), %route, "incoming");
    match route {
        Route::Dns { strategy } => {
            let response = gateway
                .handle_dns(config, strategy, inbound_request(request))
                .await;
            into_hyper(response)
        }
        Route::Proxy { destination } => {
            if is_websocket_upgrade(request.headers()) {
                upgrade_websocket(gateway, config, request, &destination).await
            } else {
                let response = gateway
                    .handle_http(config, inbound_request(request), &destination)
                    .await;
                into_hyper(response)
            }
        }
    }
}

/// Connects to `destination` first, then accepts the client upgrade and
/// relays between both sides on a new task.
async fn upgrade_websocket(
    gateway: &Gateway,
    config: &StrategyConfig,
    mut request: Request<Incoming>,
    destination: &str,
) -> Response<HyperBody> {
    let Some(accept) = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .and_then(|accept| HeaderValue::from_str(&accept).ok())
    else {
        return into_hyper(OutboundResponse::text(
            StatusCode::BAD_REQUEST,
            "Missing Sec-WebSocket-Key",
        ));
    };
    let on_upgrade = hyper::upgrade::on(&mut request);
    let (parts, _body) = request.into_parts();
    let socket = match gateway
        .open_websocket(config, &parts.headers, destination)
        .await
    {
        Ok(socket) => socket,
        Err(response) => return into_hyper(response),
    };

    let protocol = socket.protocol.clone();
    tokio::spawn(
        async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    warn!("client upgrade failed: {err:#}");
                    return;
                }
            };
            let client =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            match relay(client, socket.stream).await {
                Ok(()) => debug!("websocket relay finished"),
                Err(err) => warn!("websocket relay failed: {err:#}"),
            }
        }
        .in_current_span(),
    );

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    response
}

fn inbound_request(request: Request<Incoming>) -> InboundRequest {
    let (parts, body) = request.into_parts();
    let body = if body.is_end_stream() {
        RequestBody::empty()
    } else {
        RequestBody::from_stream(
            body.into_data_stream()
                .map(|chunk| chunk.map_err(|err| GatewayError::from(io::Error::other(err)))),
        )
    };
    InboundRequest::new(parts.method, parts.uri, parts.headers, body)
}

fn into_hyper(response: OutboundResponse) -> Response<HyperBody> {
    let OutboundResponse {
        status,
        reason,
        mut headers,
        body,
    } = response;
    strip_hop_by_hop(&mut headers);
    let body = StreamBody::new(
        body.into_stream()
            .map(|chunk| chunk.map(Frame::data).map_err(|err| io::Error::other(format!("{err:#}")))),
    )
    .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    if let Some(reason) = reason
        .filter(|reason| Some(reason.as_str()) != status.canonical_reason())
        .and_then(|reason| ReasonPhrase::try_from(reason.into_bytes()).ok())
    {
        response.extensions_mut().insert(reason);
    }
    response
}

fn empty_body() -> HyperBody {
    Empty::new().map_err(infallible_to_io).boxed_unsync()
}

fn infallible_to_io(err: Infallible) -> io::Error {
    match err {}
}
