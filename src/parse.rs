use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING},
    uri::Uri,
};
use tokio::io::AsyncRead;

use crate::{
    body::BodyFraming,
    error::GatewayError,
    util::{HEAD_TERMINATOR, Prebuffered, find_subsequence, resume_offset},
};

/// Upper bound for a response head before it is rejected.
pub(crate) const MAX_HEAD_LEN: usize = 64 * 1024;

/// Request header name prefixes that are never forwarded to a destination.
const FILTERED_PREFIXES: &[&str] = &[
    "host",
    "accept-encoding",
    "cf-",
    "cdn-",
    "referer",
    "referrer",
];

/// Hop-by-hop headers that only apply to a single connection.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Host and port authority of a destination.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme. IPv6 literals keep their brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl Authority {
    /// Parses an absolute-form URI and infers the port from the scheme.
    ///
    /// Note: if no port is present, only `http(s)` and `ws(s)` schemes are accepted.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self, GatewayError> {
        let authority = uri
            .authority()
            .ok_or_else(|| GatewayError::invalid_destination("missing host"))?;
        let host = authority.host();
        if host.is_empty() {
            return Err(GatewayError::invalid_destination("missing host"));
        }
        let port = match authority.port_u16() {
            Some(port) => port,
            None => uri
                .scheme_str()
                .and_then(default_port)
                .ok_or_else(|| GatewayError::invalid_destination("missing port"))?,
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// A destination URL that a strategy forwards to.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{url}")]
pub struct Destination {
    url: String,
    scheme: String,
    authority: Authority,
    path_and_query: String,
}

impl FromStr for Destination {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Destination {
    /// Parses an absolute destination URL.
    pub fn parse(url: &str) -> Result<Self, GatewayError> {
        let uri = Uri::from_str(url)
            .map_err(|err| GatewayError::invalid_destination(format!("{url}: {err}")))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| GatewayError::invalid_destination(format!("{url}: missing scheme")))?
            .to_ascii_lowercase();
        let authority = Authority::from_absolute_uri(&uri)?;
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        let path_and_query = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        Ok(Self {
            url: url.to_string(),
            scheme,
            authority,
            path_and_query,
        })
    }

    /// The URL as it was given.
    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.authority.host
    }

    pub fn port(&self) -> u16 {
        self.authority.port
    }

    /// Origin-form request target, always starting with `/`.
    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    /// Whether connections to this destination use TLS.
    pub fn tls(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.scheme.as_str(), "ws" | "wss")
    }

    /// Value of the `Host` header: the hostname, plus the port if it is not
    /// the scheme's default.
    pub fn host_header(&self) -> String {
        if default_port(&self.scheme) == Some(self.authority.port) {
            self.authority.host.clone()
        } else {
            self.authority.to_string()
        }
    }
}

/// Status line and header section of an HTTP/1.x response.
#[derive(Debug, Clone)]
pub struct ParsedHttpHead {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Headers in the order they were received.
    pub headers: HeaderMap,
    /// Offset of the first body byte in the buffer the head was parsed from.
    pub body_offset: usize,
}

impl ParsedHttpHead {
    /// Parses a head from `buf` and returns `None` when the head is incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, GatewayError> {
        match find_subsequence(buf, HEAD_TERMINATOR, 0) {
            Some(pos) => Self::parse_head(&buf[..pos], pos + HEAD_TERMINATOR.len()).map(Some),
            None => Ok(None),
        }
    }

    fn parse_head(head: &[u8], body_offset: usize) -> Result<Self, GatewayError> {
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let (status, reason) = parse_status_line(status_line)?;
        let mut headers = HeaderMap::new();
        for line in lines {
            let Some((name, value)) = line.split_once(": ") else {
                continue;
            };
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) else {
                continue;
            };
            headers.append(name, value);
        }
        Ok(Self {
            status,
            reason,
            headers,
            body_offset,
        })
    }

    /// Reads until the end of the response head and parses it.
    ///
    /// Removes the head from `reader`; bytes after it stay buffered.
    pub async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Self, GatewayError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find_subsequence(reader.buffer(), HEAD_TERMINATOR, scanned) {
                let head =
                    Self::parse_head(&reader.buffer()[..pos], pos + HEAD_TERMINATOR.len())?;
                reader.discard(head.body_offset);
                return Ok(head);
            }
            scanned = resume_offset(reader.len(), HEAD_TERMINATOR.len());
            if reader.len() > MAX_HEAD_LEN {
                return Err(GatewayError::malformed_response(
                    "response head exceeds size limit",
                ));
            }
            if reader.buffer_more().await? == 0 {
                return Err(GatewayError::malformed_response(
                    "connection closed before the end of the response head",
                ));
            }
        }
    }

    /// Returns how the body following this head is delimited.
    pub fn framing(&self) -> Result<BodyFraming, GatewayError> {
        let chunked = self
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Ok(BodyFraming::Chunked);
        }
        match self.headers.get(CONTENT_LENGTH) {
            None => Ok(BodyFraming::Fixed(0)),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .map(BodyFraming::Fixed)
                .ok_or_else(|| GatewayError::malformed_response("invalid content-length")),
        }
    }
}

fn parse_status_line(line: &str) -> Result<(StatusCode, String), GatewayError> {
    let rest = line
        .strip_prefix("HTTP/1.1 ")
        .or_else(|| line.strip_prefix("HTTP/1.0 "))
        .ok_or_else(|| GatewayError::malformed_response(format!("invalid status line: {line}")))?;
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::malformed_response(format!(
            "invalid status code: {code}"
        )));
    }
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| GatewayError::malformed_response(format!("invalid status code: {code}")))?;
    Ok((status, reason.to_string()))
}

/// Serializes a request line and header section.
pub(crate) fn encode_request_head(method: &Method, target: &str, headers: &HeaderMap) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

/// Copies the request headers that may be forwarded to a destination.
///
/// Drops the gateway's own host, compression, CDN and referrer headers,
/// `Expect`, and hop-by-hop headers.
pub(crate) fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if FILTERED_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
            || *name == EXPECT
            || is_hop_by_hop(name)
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Removes hop-by-hop headers in place.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
