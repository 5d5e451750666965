use crate::cache::DnLoginCache;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::second_factor::SecondFactor;
use crate::session::ProxySession;
use crate::tls;
use anyhow::{Context, Result};
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info};

/// Client-side stream: plain TCP (ldap://) or TLS (ldaps://).
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(ServerTlsStream<TcpStream>),
}

impl tokio::io::AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Upstream stream: plain TCP (ldap://) or TLS (ldaps://).
pub enum UpstreamStream {
    Tcp(TcpStream),
    Tls(ClientTlsStream<TcpStream>),
}

impl tokio::io::AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub struct MfaProxy<A> {
    listen_url: String,
    config: Arc<Config>,
    cache: Arc<DnLoginCache>,
    second_factor: Arc<A>,
    metrics: Arc<Metrics>,
    /// When Some, the listener speaks LDAPS.
    tls_acceptor: Option<TlsAcceptor>,
}

impl<A: SecondFactor> MfaProxy<A> {
    pub fn new(
        listen_url: String,
        config: Arc<Config>,
        cache: Arc<DnLoginCache>,
        second_factor: Arc<A>,
        metrics: Arc<Metrics>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            listen_url,
            config,
            cache,
            second_factor,
            metrics,
            tls_acceptor,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = parse_listen_url(&self.listen_url)?;

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("LDAP proxy listening on {}", addr);
        info!("Upstream directory: {}", self.config.upstream.uri);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    self.metrics.inc_sessions();
                    let config = Arc::clone(&self.config);
                    let cache = Arc::clone(&self.cache);
                    let second_factor = Arc::clone(&self.second_factor);
                    let metrics = Arc::clone(&self.metrics);
                    let acceptor = self.tls_acceptor.clone();

                    tokio::spawn(async move {
                        let client_stream = if let Some(acceptor) = acceptor {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => ClientStream::Tls(tls_stream),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            }
                        } else {
                            ClientStream::Tcp(stream)
                        };
                        let upstream = match connect_upstream(&config).await {
                            Ok(s) => s,
                            Err(e) => {
                                error!("Upstream connect failed for {}: {:#}", peer_addr, e);
                                return;
                            }
                        };
                        ProxySession::new(
                            client_stream,
                            upstream,
                            &config.service_accounts,
                            cache,
                            second_factor,
                            metrics,
                            peer_addr.to_string(),
                        )
                        .run()
                        .await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Open the paired upstream connection: TCP for ldap://, TLS for ldaps://.
pub async fn connect_upstream(config: &Config) -> Result<UpstreamStream> {
    let upstream = &config.upstream;
    let (host, port) = parse_ldap_uri_to_host_port(&upstream.uri)?;
    let addr = format!("{}:{}", host, port);
    let timeout = Duration::from_secs(upstream.connect_timeout_sec.unwrap_or(5));
    let is_ldaps = upstream.uri.starts_with("ldaps://");

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("Timed out connecting to upstream {}", addr))?
        .with_context(|| format!("Failed to connect to upstream {}", addr))?;

    if !is_ldaps {
        return Ok(UpstreamStream::Tcp(tcp));
    }

    let tls_config = if upstream.tls_skip_verify.unwrap_or(false) {
        tls::client_config_insecure()?
    } else {
        tls::client_config_with_ca(upstream.tls_ca_file.as_deref())?
    };
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(host)
        .map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", addr))?;
    let tls_stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .with_context(|| format!("Timed out in TLS handshake to upstream {}", addr))?
        .with_context(|| format!("TLS handshake to upstream {} failed", addr))?;
    Ok(UpstreamStream::Tls(tls_stream))
}

fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    // Parse ldap://host:port or ldaps://host:port
    let url = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;

    let url = url.trim_start_matches('/');

    if url.starts_with(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = url
            .trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

/// Parse "ldap://host:port" or "ldaps://host:port" to (host, port).
fn parse_ldap_uri_to_host_port(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("ldap://")
        .or_else(|| uri.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid LDAP URI scheme: {}", uri))?;
    let rest = rest.trim_start_matches('/');
    let (host, port_str) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("No port in URI: {}", uri))?;
    let port: u16 = port_str
        .parse()
        .with_context(|| format!("Invalid port in URI: {}", uri))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_url_ldap() {
        let addr = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_parse_listen_url_ldaps() {
        let addr = parse_listen_url("ldaps://0.0.0.0:636").unwrap();
        assert_eq!(addr.port(), 636);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_parse_listen_url_port_only() {
        let addr = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_parse_listen_url_invalid_scheme() {
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
        assert!(parse_listen_url("invalid://127.0.0.1:1389").is_err());
    }

    #[test]
    fn test_parse_listen_url_invalid_port() {
        assert!(parse_listen_url("ldap://:99999").is_err());
        assert!(parse_listen_url("ldap://:abc").is_err());
    }

    #[test]
    fn test_parse_ldap_uri_to_host_port() {
        let (host, port) = parse_ldap_uri_to_host_port("ldap://dc1.example.com:389").unwrap();
        assert_eq!(host, "dc1.example.com");
        assert_eq!(port, 389);

        let (host, port) = parse_ldap_uri_to_host_port("ldaps://dc1:636").unwrap();
        assert_eq!(host, "dc1");
        assert_eq!(port, 636);
    }

    #[test]
    fn test_parse_ldap_uri_rejects_missing_port_and_scheme() {
        assert!(parse_ldap_uri_to_host_port("ldap://dc1.example.com").is_err());
        assert!(parse_ldap_uri_to_host_port("dc1.example.com:389").is_err());
    }
}
