//! Transport strategies: the interchangeable ways of reaching a destination.

use std::sync::Arc;

use dynosaur::dynosaur;
use http::{HeaderMap, StatusCode};

use crate::{
    error::GatewayError,
    message::{InboundRequest, OutboundResponse},
    parse::Destination,
    strategy::fetch::DynFetch,
    transport::DynConnector,
    ws::UpgradedSocket,
};

pub use self::{
    dns::{DohStrategy, DotStrategy},
    fetch::{Fetch, FetchRequest, FetchStrategy, RelayKind, RelayStrategy, ReqwestFetch},
    select::select,
    socket::DirectSocket,
    socks5::Socks5Strategy,
};

mod dns;
pub mod fetch;
mod select;
mod socket;
mod socks5;

/// A capability a strategy may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Capability {
    #[display("HTTP")]
    Http,
    #[display("WebSocket")]
    WebSocket,
    #[display("DNS")]
    Dns,
}

/// Outcome of a strategy operation that a strategy may decline.
#[derive(Debug)]
pub enum Handled<T> {
    Done(T),
    /// The strategy does not provide this capability.
    Unsupported {
        capability: Capability,
        status: StatusCode,
        reason: &'static str,
    },
}

impl<T> Handled<T> {
    pub(crate) fn unsupported(capability: Capability, reason: &'static str) -> Self {
        Self::Unsupported {
            capability,
            status: StatusCode::BAD_REQUEST,
            reason,
        }
    }

    pub(crate) fn not_implemented(capability: Capability) -> Self {
        Self::Unsupported {
            capability,
            status: StatusCode::NOT_IMPLEMENTED,
            reason: "DNS query handling not implemented for this proxy type",
        }
    }
}

impl Handled<OutboundResponse> {
    /// Turns an unsupported outcome into its plain-text response.
    pub fn into_response(self) -> OutboundResponse {
        match self {
            Handled::Done(response) => response,
            Handled::Unsupported { status, reason, .. } => OutboundResponse::text(status, reason),
        }
    }
}

/// A way of reaching destinations.
#[dynosaur(pub DynTransportStrategy = dyn(box) TransportStrategy)]
pub trait TransportStrategy: Send + Sync {
    /// Forwards an HTTP request to `destination` and returns its response.
    fn handle_http<'a>(
        &'a self,
        request: InboundRequest,
        destination: &'a Destination,
    ) -> impl Future<Output = Result<Handled<OutboundResponse>, GatewayError>> + Send + 'a;

    /// Opens a WebSocket connection to `destination`, forwarding the
    /// headers of the client's upgrade request.
    ///
    /// Returns the socket after the destination accepted the upgrade.
    fn open_websocket<'a>(
        &'a self,
        headers: &'a HeaderMap,
        destination: &'a Destination,
    ) -> impl Future<Output = Result<Handled<UpgradedSocket>, GatewayError>> + Send + 'a;

    /// Answers a DNS query carried in the request body.
    fn handle_dns<'a>(
        &'a self,
        request: InboundRequest,
    ) -> impl Future<Output = Result<Handled<OutboundResponse>, GatewayError>> + Send + 'a;
}

/// The shared clients strategies are built from.
#[derive(derive_more::Debug, Clone)]
pub struct Services {
    #[debug("Connector")]
    pub connector: Arc<DynConnector<'static>>,
    #[debug("Fetch")]
    pub fetch: Arc<DynFetch<'static>>,
}

fn require_websocket(destination: &Destination) -> Result<(), GatewayError> {
    if destination.is_websocket() {
        Ok(())
    } else {
        Err(GatewayError::invalid_destination(
            "Target does not support WebSocket",
        ))
    }
}
