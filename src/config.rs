//! Gateway configuration loaded from a flat key/value source.

use std::{collections::HashMap, str::FromStr, time::Duration};

use tracing::warn;

use crate::error::GatewayError;

/// Transport strategy names accepted in `PROXY_STRATEGY` and
/// `FALLBACK_PROXY_STRATEGY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum StrategyKind {
    #[display("socket")]
    Socket,
    #[display("fetch")]
    Fetch,
    #[display("socks5")]
    Socks5,
    #[display("thirdparty")]
    ThirdParty,
    #[display("cloudprovider")]
    CloudProvider,
    #[display("doh")]
    Doh,
    #[display("dot")]
    Dot,
}

impl FromStr for StrategyKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(Self::Socket),
            "fetch" => Ok(Self::Fetch),
            "socks5" => Ok(Self::Socks5),
            "thirdparty" => Ok(Self::ThirdParty),
            "cloudprovider" => Ok(Self::CloudProvider),
            "doh" => Ok(Self::Doh),
            "dot" => Ok(Self::Dot),
            other => Err(GatewayError::config(format!("unknown strategy {other:?}"))),
        }
    }
}

impl StrategyKind {
    /// Parses a strategy name, resolving unknown names to `default`.
    pub fn parse_or(s: &str, default: StrategyKind) -> StrategyKind {
        s.parse().unwrap_or_else(|_| {
            warn!(name = %s, %default, "unknown strategy name");
            default
        })
    }

    /// Whether transient failures of this strategy are retried over the
    /// fallback strategy.
    pub fn falls_back(self) -> bool {
        matches!(self, Self::Socket)
    }

    /// The strategy used when this kind is configured as the fallback.
    ///
    /// Only strategies that can forward arbitrary HTTP requests qualify;
    /// anything else resolves to [`StrategyKind::Fetch`].
    pub fn fallback_target(self) -> StrategyKind {
        match self {
            Self::Fetch | Self::Socks5 | Self::ThirdParty | Self::CloudProvider => self,
            Self::Socket | Self::Doh | Self::Dot => Self::Fetch,
        }
    }
}

/// A DNS server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsServer {
    pub hostname: String,
    pub port: u16,
    /// Request path, only used for DoH.
    pub path: String,
}

/// Immutable configuration snapshot passed to every request.
#[derive(derive_more::Debug, Clone)]
pub struct StrategyConfig {
    #[debug(skip)]
    pub auth_token: String,
    pub default_dst_url: String,
    pub debug_mode: bool,
    pub strategy: StrategyKind,
    pub fallback: StrategyKind,
    /// `[user:pass@]host:port`, parsed when the SOCKS5 strategy is built.
    #[debug(skip)]
    pub socks5_address: String,
    pub third_party_proxy_url: String,
    pub cloud_provider_url: String,
    pub doh: DnsServer,
    pub dot: DnsServer,
    pub connect_timeout: Duration,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            auth_token: "your-auth-token".to_string(),
            default_dst_url: "https://httpbin.org/get".to_string(),
            debug_mode: false,
            strategy: StrategyKind::Socket,
            fallback: StrategyKind::Fetch,
            socks5_address: String::new(),
            third_party_proxy_url: String::new(),
            cloud_provider_url: String::new(),
            doh: DnsServer {
                hostname: "dns.google".to_string(),
                port: 443,
                path: "/dns-query".to_string(),
            },
            dot: DnsServer {
                hostname: "dns.google".to_string(),
                port: 853,
                path: String::new(),
            },
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl StrategyConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_vars(std::env::vars())
    }

    /// Loads the configuration from key/value pairs, keeping defaults for
    /// absent keys.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut config = Self::default();
        let get = |key: &str| vars.get(key).map(String::as_str);

        if let Some(value) = get("AUTH_TOKEN") {
            config.auth_token = value.to_string();
        }
        if let Some(value) = get("DEFAULT_DST_URL") {
            config.default_dst_url = value.to_string();
        }
        if let Some(value) = get("DEBUG_MODE") {
            config.debug_mode = value == "true";
        }
        if let Some(value) = get("PROXY_STRATEGY") {
            config.strategy = StrategyKind::parse_or(value, StrategyKind::Socket);
        }
        if let Some(value) = get("FALLBACK_PROXY_STRATEGY") {
            config.fallback = StrategyKind::parse_or(value, StrategyKind::Fetch);
        }
        if let Some(value) = get("SOCKS5_ADDRESS") {
            config.socks5_address = value.to_string();
        }
        if let Some(value) = get("THIRD_PARTY_PROXY_URL") {
            config.third_party_proxy_url = value.to_string();
        }
        if let Some(value) = get("CLOUD_PROVIDER_URL") {
            config.cloud_provider_url = value.to_string();
        }
        if let Some(value) = get("DOH_SERVER_HOSTNAME") {
            config.doh.hostname = value.to_string();
        }
        if let Some(value) = get("DOH_SERVER_PORT") {
            config.doh.port = parse_number("DOH_SERVER_PORT", value)?;
        }
        if let Some(value) = get("DOH_SERVER_PATH") {
            config.doh.path = value.to_string();
        }
        if let Some(value) = get("DOT_SERVER_HOSTNAME") {
            config.dot.hostname = value.to_string();
        }
        if let Some(value) = get("DOT_SERVER_PORT") {
            config.dot.port = parse_number("DOT_SERVER_PORT", value)?;
        }
        if let Some(value) = get("CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(parse_number("CONNECT_TIMEOUT_MS", value)?);
        }
        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, GatewayError> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::config(format!("{key} is not a valid number: {value:?}")))
}
