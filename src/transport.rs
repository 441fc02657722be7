//! The raw socket primitive the strategies build on.

use std::{io, sync::Arc, time::Duration};

use dynosaur::dynosaur;
use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tracing::trace;

/// A bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Duplex for T {}

/// A boxed [`Duplex`] stream returned by a [`Connector`].
pub type BoxedStream = Box<dyn Duplex>;

/// Opens byte streams to remote hosts.
#[dynosaur(pub DynConnector = dyn(box) Connector)]
pub trait Connector: Send + Sync {
    /// Opens a stream to `host:port`, optionally wrapped in TLS.
    ///
    /// `host` may be a bracketed IPv6 literal.
    fn open<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        tls: bool,
    ) -> impl Future<Output = io::Result<BoxedStream>> + Send + 'a;

    /// Starts a TLS session for `host` over an already open stream.
    fn start_tls<'a>(
        &'a self,
        host: &'a str,
        stream: BoxedStream,
    ) -> impl Future<Output = io::Result<BoxedStream>> + Send + 'a;
}

/// Connects over TCP and uses rustls with the webpki root set for TLS.
#[derive(derive_more::Debug, Clone)]
pub struct TcpConnector {
    #[debug("TlsConnector")]
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> io::Result<Self> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }
}

impl Connector for TcpConnector {
    async fn open<'a>(&'a self, host: &'a str, port: u16, tls: bool) -> io::Result<BoxedStream> {
        let host = unbracket(host);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection to {host}:{port} timed out"),
                )
            })??;
        stream.set_nodelay(true).ok();
        trace!(%host, port, tls, "tcp connected");
        if tls {
            self.start_tls(host, Box::new(stream)).await
        } else {
            Ok(Box::new(stream))
        }
    }

    async fn start_tls<'a>(&'a self, host: &'a str, stream: BoxedStream) -> io::Result<BoxedStream> {
        let server_name = ServerName::try_from(unbracket(host).to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let stream = self.tls.connect(server_name, stream).await?;
        trace!(%host, "tls established");
        Ok(Box::new(stream))
    }
}

/// Strips the brackets from an IPv6 literal.
pub(crate) fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use n0_tracing_test::traced_test;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn strips_ipv6_brackets() {
        assert_eq!(unbracket("[::1]"), "::1");
        assert_eq!(unbracket("example.com"), "example.com");
        assert_eq!(unbracket("[::1"), "[::1");
    }

    #[tokio::test]
    #[traced_test]
    async fn opens_plain_tcp() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            stream.write_all(b"hi").await?;
            io::Result::Ok(())
        });
        let connector = TcpConnector::new(Duration::from_secs(5))?;
        let mut stream = connector.open("127.0.0.1", addr.port(), false).await?;
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hi");
        server.await??;
        Ok(())
    }
}
