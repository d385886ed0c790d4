mod factory;
mod tcp;
mod tls;

pub use factory::{create_transport_client, create_transport_server};
pub use tcp::{TcpTransportClient, TcpTransportServer};
pub use tls::{TlsTransportClient, TlsTransportServer};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// 明文 TCP（仅用于开发和测试）
    Tcp,
    /// TCP + TLS
    #[default]
    Tls,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::Tls => write!(f, "tls"),
        }
    }
}

impl std::str::FromStr for TransportType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tls" | "https" => Ok(Self::Tls),
            _ => anyhow::bail!("Unknown transport type: {}", s),
        }
    }
}

/// 传输层连接抽象
///
/// 控制连接和数据连接都以该 trait 对象的形式传递
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 一条物理连接
pub type Conn = Pin<Box<dyn Transport>>;

/// 传输层客户端接口（agent 侧用来连接 hub）
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 连接到服务器并返回传输层连接
    async fn connect(&self) -> Result<Conn>;

    /// 获取传输类型
    fn transport_type(&self) -> TransportType;
}

/// 传输层服务器接口
///
/// accept 与 handshake 分开，握手在每个连接自己的任务里完成，
/// 慢速客户端不会阻塞 accept 循环
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// 接受新的 TCP 连接
    async fn accept(&self) -> Result<(TcpStream, SocketAddr)>;

    /// 在接受的 TCP 连接上完成传输层握手
    async fn handshake(&self, stream: TcpStream) -> Result<Conn>;

    /// 实际监听地址
    fn local_addr(&self) -> Result<SocketAddr>;

    /// 获取传输类型
    fn transport_type(&self) -> TransportType;
}
