mod body;
pub mod config;
pub mod dns;
mod error;
mod gateway;
mod message;
mod parse;
mod router;
pub mod server;
pub mod socks5;
pub mod strategy;
pub mod transport;
mod util;
pub mod ws;

pub use {
    body::{BodyDecoder, BodyFraming},
    config::{DnsServer, StrategyConfig, StrategyKind},
    error::GatewayError,
    gateway::Gateway,
    message::{BodyStream, InboundRequest, OutboundResponse, RequestBody, ResponseBody},
    parse::{Authority, Destination, ParsedHttpHead},
    router::{Route, route},
    util::Prebuffered,
};
