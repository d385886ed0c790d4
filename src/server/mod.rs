mod registry;

pub use registry::TunnelRegistry;

use crate::config::{ServerConfig, TunnelSettings};
use crate::control_channel::ControlChannel;
use crate::control_protocol::{Hello, MAX_LINE_LENGTH};
use crate::dialer::Dialer;
use crate::error::{Result, TunnelError};
use crate::proxy::{ReverseProxyRouter, TunnelPathResolver};
use crate::transport::{create_transport_server, Conn, Transport, TransportServer};
use anyhow::Context;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行 hub：隧道握手和 HTTP 请求共用同一个监听端口
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!(
        "Starting tunnel hub on {} using {} transport",
        config.server_addr,
        config.transport()
    );

    let registry = TunnelRegistry::new();
    let router = Arc::new(ReverseProxyRouter::new(
        registry.clone(),
        Arc::new(TunnelPathResolver),
        config.upstream_authority.clone(),
        &config.tunnel,
    ));
    let server = Arc::new(TunnelServer::new(registry, router, config.tunnel.clone()));

    let transport = create_transport_server(&config)
        .await
        .context("Failed to create transport server")?;

    server.run(transport).await
}

/// hub 侧服务器
///
/// 每条新连接先嗅探第一个字节：`{` 表示 agent 的 Hello 行（控制连接或 pickup 连接），
/// 其他情况按 HTTP/1 处理并交给路由。
pub struct TunnelServer {
    registry: Arc<TunnelRegistry>,
    router: Arc<ReverseProxyRouter>,
    settings: TunnelSettings,
}

impl TunnelServer {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        router: Arc<ReverseProxyRouter>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            registry,
            router,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<ReverseProxyRouter> {
        &self.router
    }

    /// 接受连接直到收到 Ctrl+C
    pub async fn run(self: Arc<Self>, transport: Arc<dyn TransportServer>) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, stopping server...");
            }
            signal.cancel();
        });

        self.run_until(transport, shutdown).await
    }

    /// 接受连接直到 shutdown 被取消
    pub async fn run_until(
        self: Arc<Self>,
        transport: Arc<dyn TransportServer>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(
            "Server listening on {} (transport: {})",
            transport.local_addr()?,
            transport.transport_type()
        );
        info!("Waiting for agent connections... (Press Ctrl+C to stop)");

        loop {
            tokio::select! {
                result = transport.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let server = Arc::clone(&self);
                            let transport = Arc::clone(&transport);
                            tokio::spawn(async move {
                                let timeout = server.settings.handshake_timeout;
                                let conn = match tokio::time::timeout(timeout, transport.handshake(stream)).await {
                                    Ok(Ok(conn)) => conn,
                                    Ok(Err(e)) => {
                                        warn!("Transport handshake with {} failed: {:#}", peer_addr, e);
                                        return;
                                    }
                                    Err(_) => {
                                        warn!("Transport handshake with {} timed out", peer_addr);
                                        return;
                                    }
                                };
                                if let Err(e) = server.handle_connection(conn).await {
                                    error!("Connection from {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        for peer in self.registry.peers() {
            self.registry.remove(&peer);
        }
        info!("Server stopped gracefully");
        Ok(())
    }

    /// 处理一条已完成传输层握手的连接
    pub async fn handle_connection(&self, conn: Conn) -> Result<()> {
        let mut reader = BufReader::new(conn);
        let timeout = self.settings.handshake_timeout;

        let first = match tokio::time::timeout(timeout, reader.fill_buf()).await {
            Ok(buf) => buf?.first().copied(),
            Err(_) => return Err(TunnelError::timeout(timeout)),
        };

        match first {
            None => {
                debug!("Connection closed before sending any data");
                Ok(())
            }
            Some(b'{') => {
                let hello = read_hello(&mut reader, timeout).await?;
                self.handle_hello(hello, reader);
                Ok(())
            }
            Some(_) => self.serve_http(reader).await,
        }
    }

    fn handle_hello<T: Transport>(&self, hello: Hello, conn: T) {
        match hello {
            Hello::Control { peer } => {
                let (channel, events) = ControlChannel::spawn(conn, &self.settings, peer.to_string());
                let dialer = Dialer::new(peer, channel, events, &self.settings);
                self.registry.register(dialer);
            }
            Hello::Pickup { conn_path } => {
                if !self.registry.deliver_pickup(&conn_path, Box::pin(conn)) {
                    warn!("Discarding unclaimed pickup connection {}", conn_path);
                }
            }
        }
    }

    async fn serve_http<T: Transport>(&self, conn: T) -> Result<()> {
        let router = Arc::clone(&self.router);
        let service = service_fn(move |req: http::Request<Incoming>| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.handle(req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(conn), service)
            .with_upgrades()
            .await
        {
            debug!("HTTP connection ended with error: {}", e);
        }
        Ok(())
    }
}

/// 读取 Hello 行（包括结尾的 `\n`）
async fn read_hello<T: Transport>(
    reader: &mut BufReader<T>,
    timeout: std::time::Duration,
) -> Result<Hello> {
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LENGTH as u64);
    let read = limited.read_until(b'\n', &mut line);
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => {
            result?;
        }
        Err(_) => return Err(TunnelError::timeout(timeout)),
    }

    if line.last() != Some(&b'\n') {
        return Err(TunnelError::handshake("hello line truncated or too long"));
    }
    line.pop();
    Hello::decode_line(&line)
}
