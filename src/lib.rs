/// Faros 反向隧道库入口
///
/// hub 通过每个 agent 的一条控制连接按需申请数据连接（Dialer），
/// agent 响应 conn-ready 建立 pickup 连接（Listener）；
/// 路由把对外的隧道路径转发到对应 agent。
pub mod cli;
pub mod client;
pub mod client_cache;
pub mod config;
pub mod control_channel;
pub mod control_protocol;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod proxy;
pub mod server;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use client_cache::{ClientCache, IdleConnections};
pub use config::{AppConfig, ClientConfig, ServerConfig, TunnelSettings};
pub use control_channel::{ControlChannel, ControlEvent};
pub use control_protocol::{ControlMessage, Hello, PeerKey, PickupPath};
pub use dialer::Dialer;
pub use error::{Result, TunnelError};
pub use listener::Listener;
pub use proxy::{PeerClient, PeerResolver, ResolvedPeer, ReverseProxyRouter, TunnelPathResolver};
pub use server::{TunnelRegistry, TunnelServer};
