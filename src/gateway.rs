//! Strategy selection and fallback orchestration.

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::{
    config::{StrategyConfig, StrategyKind},
    error::GatewayError,
    message::{InboundRequest, OutboundResponse},
    parse::Destination,
    strategy::{Handled, ReqwestFetch, Services, TransportStrategy, fetch::DynFetch, select},
    transport::{DynConnector, TcpConnector},
    ws::UpgradedSocket,
};

/// Runs requests through the configured strategy, retrying transient
/// failures over the fallback strategy.
#[derive(Debug, Clone)]
pub struct Gateway {
    services: Services,
}

impl Gateway {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// A gateway that connects over TCP/rustls and fetches with reqwest.
    pub fn with_defaults(connect_timeout: Duration) -> Result<Self, GatewayError> {
        let connector: Arc<DynConnector<'static>> =
            DynConnector::new_arc(TcpConnector::new(connect_timeout)?);
        let fetch: Arc<DynFetch<'static>> = DynFetch::new_arc(ReqwestFetch::new()?);
        Ok(Self::new(Services { connector, fetch }))
    }

    /// Forwards `request` to `destination`.
    ///
    /// Never fails: errors are turned into plain-text responses.
    pub async fn handle_http(
        &self,
        config: &StrategyConfig,
        mut request: InboundRequest,
        destination: &str,
    ) -> OutboundResponse {
        let kind = config.strategy;
        let destination = match Destination::parse(destination) {
            Ok(destination) => destination,
            Err(err) => return connection_error(kind, &err),
        };
        // The replay copy has to exist before the first attempt reads the body.
        let replay = if kind.falls_back() {
            match request.duplicate().await {
                Ok(replay) => Some(replay),
                Err(err) => return connection_error(kind, &err),
            }
        } else {
            None
        };

        let err = match self.try_http(kind, config, request, &destination).await {
            Ok(response) => return response,
            Err(err) => err,
        };
        let Some(replay) = replay.filter(|_| err.is_transient()) else {
            warn!(strategy = %kind, %destination, "request failed: {err:#}");
            return connection_error(kind, &err);
        };

        let fallback = config.fallback.fallback_target();
        warn!(strategy = %kind, %fallback, %destination, "transient failure, falling back: {err:#}");
        match self.try_http(fallback, config, replay, &destination).await {
            Ok(response) => response,
            Err(err) => {
                warn!(strategy = %fallback, %destination, "fallback failed: {err:#}");
                connection_error(fallback, &err)
            }
        }
    }

    async fn try_http(
        &self,
        kind: StrategyKind,
        config: &StrategyConfig,
        request: InboundRequest,
        destination: &Destination,
    ) -> Result<OutboundResponse, GatewayError> {
        let strategy = select(kind, config, &self.services)?;
        debug!(strategy = %kind, %destination, method = %request.method, "forwarding");
        let handled = strategy.handle_http(request, destination).await?;
        Ok(handled.into_response())
    }

    /// Opens a WebSocket to `destination`, forwarding the headers of the
    /// client's upgrade request.
    ///
    /// On failure returns the response to send instead of the upgrade.
    pub async fn open_websocket(
        &self,
        config: &StrategyConfig,
        headers: &HeaderMap,
        destination: &str,
    ) -> Result<UpgradedSocket, OutboundResponse> {
        let kind = config.strategy;
        let destination =
            Destination::parse(destination).map_err(|err| connection_error(kind, &err))?;
        let err = match self.try_websocket(kind, config, headers, &destination).await {
            Ok(handled) => return handled_socket(handled),
            Err(err) => err,
        };
        if !(kind.falls_back() && err.is_transient()) {
            warn!(strategy = %kind, %destination, "websocket failed: {err:#}");
            return Err(connection_error(kind, &err));
        }

        let fallback = config.fallback.fallback_target();
        warn!(strategy = %kind, %fallback, %destination, "transient websocket failure, falling back: {err:#}");
        match self.try_websocket(fallback, config, headers, &destination).await {
            Ok(handled) => handled_socket(handled),
            Err(err) => Err(connection_error(fallback, &err)),
        }
    }

    async fn try_websocket(
        &self,
        kind: StrategyKind,
        config: &StrategyConfig,
        headers: &HeaderMap,
        destination: &Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        let strategy = select(kind, config, &self.services)?;
        debug!(strategy = %kind, %destination, "opening websocket");
        strategy.open_websocket(headers, destination).await
    }

    /// Answers the DNS query in `request` with the `kind` strategy.
    pub async fn handle_dns(
        &self,
        config: &StrategyConfig,
        kind: StrategyKind,
        request: InboundRequest,
    ) -> OutboundResponse {
        let result = match select(kind, config, &self.services) {
            Ok(strategy) => strategy.handle_dns(request).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(handled) => handled.into_response(),
            Err(err) => {
                warn!(strategy = %kind, "dns query failed: {err:#}");
                OutboundResponse::error(StatusCode::BAD_GATEWAY, "handling DNS query", &err)
            }
        }
    }
}

fn handled_socket(handled: Handled<UpgradedSocket>) -> Result<UpgradedSocket, OutboundResponse> {
    match handled {
        Handled::Done(socket) => Ok(socket),
        Handled::Unsupported { status, reason, .. } => Err(OutboundResponse::text(status, reason)),
    }
}

fn connection_error(kind: StrategyKind, err: &GatewayError) -> OutboundResponse {
    OutboundResponse::error(err.response_status(), &format!("in {kind} connection"), err)
}
