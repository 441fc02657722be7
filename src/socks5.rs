//! Client side of the SOCKS5 handshake (RFC 1928, RFC 1929).

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use bytes::{BufMut, BytesMut};
use n0_error::e;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{error::GatewayError, transport::unbracket, util::Prebuffered};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Username and password for RFC 1929 authentication.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    #[debug("***")]
    pub password: String,
}

/// Address of the CONNECT target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl TargetAddr {
    /// Infers the address type from a host string.
    ///
    /// IPv6 literals may be bracketed.
    pub fn from_host(host: &str) -> Self {
        let bare = unbracket(host);
        if let Ok(ip) = bare.parse::<Ipv4Addr>() {
            Self::Ipv4(ip)
        } else if let Ok(ip) = bare.parse::<Ipv6Addr>() {
            Self::Ipv6(ip)
        } else {
            Self::Domain(host.to_string())
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), GatewayError> {
        match self {
            Self::Ipv4(ip) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Self::Ipv6(ip) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Self::Domain(domain) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| GatewayError::socks5_protocol("domain name too long"))?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len);
                buf.put_slice(domain.as_bytes());
            }
        }
        Ok(())
    }
}

/// Location and credentials of a SOCKS5 server, parsed from
/// `[user:pass@]host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Address {
    pub credentials: Option<Credentials>,
    pub host: String,
    pub port: u16,
}

impl FromStr for Socks5Address {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GatewayError::config(format!("invalid SOCKS5 address: {s}"));
        let (credentials, server) = match s.rsplit_once('@') {
            Some((auth, server)) => {
                let (username, password) = auth.split_once(':').ok_or_else(invalid)?;
                if password.contains(':') {
                    return Err(invalid());
                }
                let credentials = Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                };
                (Some(credentials), server)
            }
            None => (None, s),
        };
        let (host, port) = server.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if host.is_empty() || (host.contains(':') && !(host.starts_with('[') && host.ends_with(']')))
        {
            return Err(invalid());
        }
        Ok(Self {
            credentials,
            host: host.to_string(),
            port,
        })
    }
}

/// A SOCKS5 negotiation for a single CONNECT tunnel.
#[derive(Debug)]
pub struct Socks5Session {
    target: TargetAddr,
    port: u16,
    credentials: Option<Credentials>,
    method: Option<u8>,
}

impl Socks5Session {
    pub fn new(host: &str, port: u16, credentials: Option<Credentials>) -> Self {
        Self {
            target: TargetAddr::from_host(host),
            port,
            credentials,
            method: None,
        }
    }

    /// Runs the handshake on `stream` and returns the established tunnel.
    ///
    /// Any bytes the server sent after its CONNECT reply stay buffered in the
    /// returned stream.
    pub async fn establish<S: AsyncRead + AsyncWrite + Unpin>(
        mut self,
        stream: S,
    ) -> Result<Prebuffered<S>, GatewayError> {
        let mut stream = Prebuffered::new(stream);
        self.negotiate_method(&mut stream).await?;
        if self.method == Some(METHOD_USER_PASS) {
            self.authenticate(&mut stream).await?;
        }
        self.connect(&mut stream).await?;
        Ok(stream)
    }

    async fn negotiate_method<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut Prebuffered<S>,
    ) -> Result<(), GatewayError> {
        stream
            .write_all(&[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])
            .await?;
        let reply = read_exact(stream, 2, "method selection").await?;
        if reply[0] != VERSION {
            return Err(GatewayError::socks5_protocol(format!(
                "unexpected version {} in method selection",
                reply[0]
            )));
        }
        match reply[1] {
            METHOD_NO_AUTH => {}
            METHOD_USER_PASS if self.credentials.is_none() => {
                return Err(e!(GatewayError::AuthRequired));
            }
            METHOD_USER_PASS => {}
            METHOD_NONE_ACCEPTABLE => return Err(e!(GatewayError::NoAcceptableAuthMethod)),
            other => {
                return Err(GatewayError::socks5_protocol(format!(
                    "server selected unoffered method {other}"
                )));
            }
        }
        debug!(method = reply[1], "socks5 method selected");
        self.method = Some(reply[1]);
        Ok(())
    }

    async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut Prebuffered<S>,
    ) -> Result<(), GatewayError> {
        let Some(credentials) = &self.credentials else {
            return Err(e!(GatewayError::AuthRequired));
        };
        let username = credentials.username.as_bytes();
        let password = credentials.password.as_bytes();
        let (Ok(ulen), Ok(plen)) = (u8::try_from(username.len()), u8::try_from(password.len()))
        else {
            return Err(GatewayError::socks5_protocol("credentials too long"));
        };
        let mut buf = BytesMut::with_capacity(3 + username.len() + password.len());
        buf.put_u8(AUTH_VERSION);
        buf.put_u8(ulen);
        buf.put_slice(username);
        buf.put_u8(plen);
        buf.put_slice(password);
        stream.write_all(&buf).await?;
        let reply = read_exact(stream, 2, "auth reply").await?;
        if reply[1] != 0x00 {
            return Err(e!(GatewayError::AuthFailed { status: reply[1] }));
        }
        debug!("socks5 authenticated");
        Ok(())
    }

    async fn connect<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut Prebuffered<S>,
    ) -> Result<(), GatewayError> {
        let mut buf = BytesMut::with_capacity(262);
        buf.put_slice(&[VERSION, CMD_CONNECT, 0x00]);
        self.target.encode(&mut buf)?;
        buf.put_u16(self.port);
        stream.write_all(&buf).await?;

        let reply = read_exact(stream, 5, "connect reply").await?;
        if reply[0] != VERSION {
            return Err(GatewayError::socks5_protocol(format!(
                "unexpected version {} in connect reply",
                reply[0]
            )));
        }
        if reply[1] != 0x00 {
            return Err(e!(GatewayError::Socks5Error { code: reply[1] }));
        }
        // the fifth byte is the first address byte, or the domain length
        let rest = match reply[3] {
            ATYP_IPV4 => 4 - 1 + 2,
            ATYP_IPV6 => 16 - 1 + 2,
            ATYP_DOMAIN => reply[4] as usize + 2,
            other => {
                return Err(GatewayError::socks5_protocol(format!(
                    "unknown bound address type {other}"
                )));
            }
        };
        read_exact(stream, rest, "bound address").await?;
        debug!(addr = ?self.target, port = self.port, "socks5 tunnel established");
        Ok(())
    }
}

async fn read_exact<S: AsyncRead + Unpin>(
    stream: &mut Prebuffered<S>,
    len: usize,
    phase: &str,
) -> Result<bytes::Bytes, GatewayError> {
    if !stream.fill_to(len).await? {
        return Err(GatewayError::socks5_protocol(format!(
            "connection closed during {phase}"
        )));
    }
    Ok(stream.split_to(len))
}
