// 传输层工厂 - 根据配置创建传输实例

use crate::config::{ClientConfig, ServerConfig};
use crate::tls;
use crate::transport::{
    TcpTransportClient, TcpTransportServer, TlsTransportClient, TlsTransportServer,
    TransportClient, TransportServer, TransportType,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const DEFAULT_TUNNEL_PORT: u16 = 8443;

/// 根据 upstream url 创建传输层客户端
///
/// `https://` / `tls://` 使用 TLS（可带客户端证书），`tcp://` 使用明文 TCP
pub fn create_transport_client(config: &ClientConfig) -> Result<Arc<dyn TransportClient>> {
    let upstream = url::Url::parse(&config.upstream_url)
        .with_context(|| format!("Invalid upstream url: {}", config.upstream_url))?;
    let host = upstream
        .host_str()
        .context("Upstream url has no host")?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = upstream.port().unwrap_or(DEFAULT_TUNNEL_PORT);
    let transport: TransportType = upstream.scheme().parse()?;

    let client: Arc<dyn TransportClient> = match transport {
        TransportType::Tcp => Arc::new(TcpTransportClient::new(format!("{}:{}", host, port))),
        TransportType::Tls => {
            let client_identity = match (&config.client_cert_path, &config.client_key_path) {
                (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
                _ => None,
            };
            let tls_config = tls::load_client_config(
                config.ca_cert_path.as_deref(),
                config.skip_verify,
                client_identity,
            )?;
            Arc::new(TlsTransportClient::new(
                host,
                port,
                TlsConnector::from(tls_config),
            ))
        }
    };

    Ok(client)
}

/// 创建传输层服务器
pub async fn create_transport_server(config: &ServerConfig) -> Result<Arc<dyn TransportServer>> {
    let server: Arc<dyn TransportServer> = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            let tls_config =
                tls::load_server_config(cert, key, config.client_ca_path.as_deref())?;
            let server =
                TlsTransportServer::bind(&config.server_addr, TlsAcceptor::from(tls_config))
                    .await
                    .context("Failed to bind TLS transport server")?;
            Arc::new(server)
        }
        _ => {
            let server = TcpTransportServer::bind(&config.server_addr)
                .await
                .context("Failed to bind TCP transport server")?;
            Arc::new(server)
        }
    };

    Ok(server)
}
