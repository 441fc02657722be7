use std::io;

use http::StatusCode;
use n0_error::{e, stack_error};

/// Message fragments that mark a transport failure as a likely network-path
/// restriction rather than a rejection by the destination.
const TRANSIENT_MARKERS: &[&str] = &[
    "network issue",
    "network connection failure",
    "connection failed",
    "timed out",
    "stream was cancelled",
    "proxy request failed",
    "cannot connect",
    "tcp loop detected",
    "port 25 are prohibited",
];

/// Errors produced by the wire codecs and the transport strategies.
#[stack_error(derive, add_meta, from_sources)]
#[non_exhaustive]
pub enum GatewayError {
    /// The response head was missing, truncated, or had an invalid status line.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// The stream ended inside a chunk or inside the trailer section.
    #[error("chunked response body was truncated")]
    TruncatedChunkedBody,

    /// The stream ended before `Content-Length` bytes were received.
    #[error("response body ended {missing} bytes early")]
    TruncatedBody { missing: u64 },

    /// A WebSocket payload too large to be encoded.
    #[error("websocket payload of {len} bytes is too large")]
    PayloadTooLarge { len: usize },

    /// A WebSocket frame that cannot be decoded.
    #[error("malformed websocket frame: {reason}")]
    MalformedFrame { reason: String },

    /// The destination did not answer the upgrade with `101 Switching Protocols`.
    #[error("websocket handshake failed: {response}")]
    HandshakeFailed { response: String },

    /// The SOCKS5 server accepted none of the offered methods.
    #[error("no acceptable socks5 auth methods")]
    NoAcceptableAuthMethod,

    /// The SOCKS5 server requires credentials but none are configured.
    #[error("socks5 server requires username/password but none are configured")]
    AuthRequired,

    /// The SOCKS5 server rejected the configured credentials.
    #[error("socks5 authentication failed with status {status}")]
    AuthFailed { status: u8 },

    /// The SOCKS5 server refused the CONNECT request.
    #[error("socks5 connect failed with reply code {code}")]
    Socks5Error { code: u8 },

    /// The SOCKS5 server violated the protocol.
    #[error("socks5 protocol error: {reason}")]
    Socks5Protocol { reason: String },

    /// A DNS message could not be framed or unframed.
    #[error("dns framing error: {reason}")]
    DnsFraming { reason: String },

    /// The destination URL is unusable for the requested operation.
    #[error("invalid destination: {reason}")]
    InvalidDestination { reason: String },

    /// A configuration value could not be used.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A request body was read after it had already been consumed.
    #[error("request body was already consumed")]
    BodyConsumed,

    /// IO error on the underlying transport.
    #[error("transport io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The generic HTTP client failed.
    #[error("fetch request failed")]
    Fetch {
        #[error(source, std_err)]
        source: reqwest::Error,
    },
}

impl GatewayError {
    #[track_caller]
    pub(crate) fn malformed_response(reason: impl ToString) -> Self {
        e!(GatewayError::MalformedResponse {
            reason: reason.to_string()
        })
    }

    #[track_caller]
    pub(crate) fn malformed_frame(reason: impl ToString) -> Self {
        e!(GatewayError::MalformedFrame {
            reason: reason.to_string()
        })
    }

    #[track_caller]
    pub(crate) fn socks5_protocol(reason: impl ToString) -> Self {
        e!(GatewayError::Socks5Protocol {
            reason: reason.to_string()
        })
    }

    #[track_caller]
    pub(crate) fn dns_framing(reason: impl ToString) -> Self {
        e!(GatewayError::DnsFraming {
            reason: reason.to_string()
        })
    }

    #[track_caller]
    pub(crate) fn invalid_destination(reason: impl ToString) -> Self {
        e!(GatewayError::InvalidDestination {
            reason: reason.to_string()
        })
    }

    #[track_caller]
    pub(crate) fn config(reason: impl ToString) -> Self {
        e!(GatewayError::Config {
            reason: reason.to_string()
        })
    }

    /// Returns true if the error is a transport failure that makes a retry
    /// over a different strategy worthwhile.
    ///
    /// Only connect/read/write failures qualify. Protocol and decode errors
    /// never do.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Io { source, .. } => {
                matches!(
                    source.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::HostUnreachable
                        | io::ErrorKind::NetworkUnreachable
                ) || has_transient_marker(&source.to_string())
            }
            _ => false,
        }
    }

    /// Returns the status code used when the error is surfaced as a response.
    pub fn response_status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidDestination { .. } | GatewayError::BodyConsumed { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn has_transient_marker(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
