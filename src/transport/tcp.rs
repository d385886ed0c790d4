use super::{Conn, TransportClient, TransportServer, TransportType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// TCP 层 keepalive，作为控制通道心跳之外的兜底
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(TCP_KEEPALIVE_TIME)
        .with_interval(TCP_KEEPALIVE_INTERVAL);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

/// 明文 TCP 传输客户端
pub struct TcpTransportClient {
    addr: String,
}

impl TcpTransportClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl TransportClient for TcpTransportClient {
    async fn connect(&self) -> Result<Conn> {
        debug!("Connecting to {} via TCP", self.addr);

        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.addr))?;
        configure_stream(&stream);

        Ok(Box::pin(stream))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }
}

/// 明文 TCP 传输服务器
pub struct TcpTransportServer {
    listener: TcpListener,
}

impl TcpTransportServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("TCP transport server listening on {}", listener.local_addr()?);

        Ok(Self { listener })
    }
}

#[async_trait]
impl TransportServer for TcpTransportServer {
    async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept TCP connection")?;
        configure_stream(&stream);
        Ok((stream, peer_addr))
    }

    async fn handshake(&self, stream: TcpStream) -> Result<Conn> {
        Ok(Box::pin(stream))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }
}
