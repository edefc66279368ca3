//! Byte-stream establishment.
//!
//! The connection engine only needs something it can read and write; the
//! [`Connector`] seam hands it a fresh stream per connection attempt. The
//! production connector opens TCP and optionally wraps it in TLS.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::config::ClientConfig;

/// A bidirectional byte stream the engine can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens a new stream for each connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<Box<dyn Transport>>;
}

/// TCP, with TLS when configured (or when the port is 6697).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    tls: bool,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            tls: config.use_tls(),
            timeout: config.connect_timeout(),
        }
    }

    async fn open(&self) -> io::Result<Box<dyn Transport>> {
        let mode = if self.tls { "TLS" } else { "plain" };
        tracing::debug!("Resolving {}:{}...", self.host, self.port);
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;
        tracing::debug!("TCP connected to {}:{} ({mode})", self.host, self.port);

        if !self.tls {
            return Ok(Box::new(tcp));
        }

        let connector = TlsConnector::from(Arc::new(rustls_default_config()));
        let dns_name = rustls::pki_types::ServerName::try_from(self.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls_stream = connector.connect(dns_name, tcp).await?;
        tracing::debug!("TLS handshake complete");
        Ok(Box::new(tls_stream))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn Transport>> {
        match tokio::time::timeout(self.timeout, self.open()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {}:{} timed out", self.host, self.port),
            )),
        }
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
