use super::{
    DirectSocket, DohStrategy, DotStrategy, DynTransportStrategy, FetchStrategy, RelayStrategy,
    Services, Socks5Strategy,
};
use crate::{
    config::{StrategyConfig, StrategyKind},
    error::GatewayError,
};

/// Builds the strategy for `kind` from `config`.
///
/// Fails only when the configuration of the selected strategy is unusable.
pub fn select(
    kind: StrategyKind,
    config: &StrategyConfig,
    services: &Services,
) -> Result<Box<DynTransportStrategy<'static>>, GatewayError> {
    let connector = services.connector.clone();
    let fetch = services.fetch.clone();
    let strategy = match kind {
        StrategyKind::Socket => DynTransportStrategy::new_box(DirectSocket::new(connector)),
        StrategyKind::Fetch => {
            DynTransportStrategy::new_box(FetchStrategy::new(fetch, config.doh.clone()))
        }
        StrategyKind::Socks5 => DynTransportStrategy::new_box(Socks5Strategy::new(
            connector,
            &config.socks5_address,
        )?),
        StrategyKind::ThirdParty => DynTransportStrategy::new_box(RelayStrategy::third_party(
            fetch,
            config.third_party_proxy_url.clone(),
        )),
        StrategyKind::CloudProvider => DynTransportStrategy::new_box(
            RelayStrategy::cloud_provider(fetch, config.cloud_provider_url.clone()),
        ),
        StrategyKind::Doh => {
            DynTransportStrategy::new_box(DohStrategy::new(connector, fetch, config.doh.clone()))
        }
        StrategyKind::Dot => {
            let doh = DohStrategy::new(connector.clone(), fetch, config.doh.clone());
            DynTransportStrategy::new_box(DotStrategy::new(connector, config.dot.clone(), doh))
        }
    };
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        strategy::fetch::tests::RecordingFetch,
        transport::{DynConnector, TcpConnector},
    };

    fn services() -> Services {
        Services {
            connector: DynConnector::new_arc(TcpConnector::new(Duration::from_secs(1)).unwrap()),
            fetch: RecordingFetch::default().boxed(),
        }
    }

    #[test]
    fn builds_every_kind() {
        let config = StrategyConfig::from_vars([("SOCKS5_ADDRESS", "proxy.test:1080")]).unwrap();
        let services = services();
        for kind in [
            StrategyKind::Socket,
            StrategyKind::Fetch,
            StrategyKind::Socks5,
            StrategyKind::ThirdParty,
            StrategyKind::CloudProvider,
            StrategyKind::Doh,
            StrategyKind::Dot,
        ] {
            assert!(select(kind, &config, &services).is_ok(), "{kind}");
        }
    }

    #[test]
    fn socks5_needs_an_address() {
        let err = select(StrategyKind::Socks5, &StrategyConfig::default(), &services()).err();
        assert!(matches!(err, Some(GatewayError::Config { .. })));
    }
}
