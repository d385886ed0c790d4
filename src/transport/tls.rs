use super::tcp::configure_stream;
use super::{Conn, TransportClient, TransportServer, TransportType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// TLS 传输客户端
pub struct TlsTransportClient {
    server_addr: String,
    server_port: u16,
    connector: TlsConnector,
}

impl TlsTransportClient {
    pub fn new(server_addr: String, server_port: u16, connector: TlsConnector) -> Self {
        Self {
            server_addr,
            server_port,
            connector,
        }
    }
}

#[async_trait]
impl TransportClient for TlsTransportClient {
    async fn connect(&self) -> Result<Conn> {
        let addr = format!("{}:{}", self.server_addr, self.server_port);
        debug!("Connecting to {} via TLS", addr);

        let tcp_stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        configure_stream(&tcp_stream);

        let server_name = ServerName::try_from(self.server_addr.clone())
            .context("Invalid server name")?
            .to_owned();

        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .context("TLS handshake failed")?;

        debug!("TLS connection established to {}", addr);
        Ok(Box::pin(tls_stream))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tls
    }
}

/// TLS 传输服务器
pub struct TlsTransportServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsTransportServer {
    pub async fn bind(addr: &str, acceptor: TlsAcceptor) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("TLS transport server listening on {}", listener.local_addr()?);

        Ok(Self { listener, acceptor })
    }
}

#[async_trait]
impl TransportServer for TlsTransportServer {
    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (tcp_stream, peer_addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept TCP connection")?;
        configure_stream(&tcp_stream);

        debug!("Accepted TCP connection from {}", peer_addr);
        Ok((tcp_stream, peer_addr))
    }

    async fn handshake(&self, stream: TcpStream) -> Result<Conn> {
        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;
        Ok(Box::pin(tls_stream))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tls
    }
}
