use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use super::{Capability, Handled, TransportStrategy, require_websocket, socket::exchange_http};
use crate::{
    error::GatewayError,
    message::{InboundRequest, OutboundResponse},
    parse::Destination,
    socks5::{Socks5Address, Socks5Session},
    transport::{BoxedStream, Connector, DynConnector},
    util::Prebuffered,
    ws::{UpgradedSocket, client_handshake},
};

/// Tunnels requests through a SOCKS5 server.
///
/// TLS to `https` and `wss` destinations runs inside the tunnel.
#[derive(derive_more::Debug)]
pub struct Socks5Strategy {
    #[debug(skip)]
    connector: Arc<DynConnector<'static>>,
    server: Socks5Address,
}

impl Socks5Strategy {
    pub fn new(connector: Arc<DynConnector<'static>>, address: &str) -> Result<Self, GatewayError> {
        if address.is_empty() {
            return Err(GatewayError::config("SOCKS5 address is not configured"));
        }
        Ok(Self {
            connector,
            server: address.parse()?,
        })
    }

    async fn tunnel(&self, destination: &Destination) -> Result<Prebuffered<BoxedStream>, GatewayError> {
        let stream = self
            .connector
            .open(&self.server.host, self.server.port, false)
            .await?;
        let session = Socks5Session::new(
            destination.host(),
            destination.port(),
            self.server.credentials.clone(),
        );
        let tunnel = session.establish(stream).await?;
        debug!(server = %self.server.host, %destination, "socks5 tunnel established");
        if destination.tls() {
            let stream = self
                .connector
                .start_tls(destination.host(), Box::new(tunnel))
                .await?;
            Ok(Prebuffered::new(stream))
        } else {
            Ok(tunnel)
        }
    }
}

impl TransportStrategy for Socks5Strategy {
    async fn handle_http<'a>(
        &'a self,
        request: InboundRequest,
        destination: &'a Destination,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        let tunnel = self.tunnel(destination).await?;
        let response = exchange_http(tunnel, request, destination).await?;
        Ok(Handled::Done(response))
    }

    async fn open_websocket<'a>(
        &'a self,
        headers: &'a HeaderMap,
        destination: &'a Destination,
    ) -> Result<Handled<UpgradedSocket>, GatewayError> {
        require_websocket(destination)?;
        let tunnel = self.tunnel(destination).await?;
        let socket = client_handshake(tunnel, destination, headers).await?;
        Ok(Handled::Done(socket))
    }

    async fn handle_dns<'a>(
        &'a self,
        _request: InboundRequest,
    ) -> Result<Handled<OutboundResponse>, GatewayError> {
        Ok(Handled::not_implemented(Capability::Dns))
    }
}
