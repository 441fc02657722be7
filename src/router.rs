use http::Uri;
use tracing::debug;

use crate::config::{StrategyConfig, StrategyKind};

/// Routing decision for an inbound request path.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Route {
    /// `/{token}/dns/{doh|dot}/...`: answer a DNS query with this strategy.
    #[display("dns via {strategy}")]
    Dns { strategy: StrategyKind },
    /// Forward the request to `destination`.
    #[display("proxy to {destination}")]
    Proxy { destination: String },
}

/// Resolves the route for `uri`.
///
/// Paths are `/{token}/{protocol}/{rest...}`; the destination becomes
/// `{protocol}://{rest}` plus the query string. A wrong token or a missing
/// protocol routes to the configured default destination.
pub fn route(uri: &Uri, config: &StrategyConfig) -> Route {
    let parts: Vec<&str> = uri.path().split('/').filter(|p| !p.is_empty()).collect();
    let authorized = parts.first() == Some(&config.auth_token.as_str());

    if authorized && parts.len() >= 3 && parts[1] == "dns" {
        let strategy = match parts[2] {
            "doh" => StrategyKind::Doh,
            "dot" => StrategyKind::Dot,
            _ => config.strategy,
        };
        return Route::Dns { strategy };
    }

    let destination = match parts.get(1) {
        Some(protocol) if authorized => {
            let rest = parts[2..].join("/");
            let query = uri
                .query()
                .filter(|q| !q.is_empty())
                .map(|q| format!("?{q}"))
                .unwrap_or_default();
            if protocol.ends_with(':') {
                format!("{protocol}//{rest}{query}")
            } else {
                format!("{protocol}://{rest}{query}")
            }
        }
        _ => config.default_dst_url.clone(),
    };
    if config.debug_mode {
        debug!(%destination, "target url");
    }
    Route::Proxy { destination }
}
