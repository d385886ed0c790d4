use crate::control_protocol::PeerKey;
use crate::transport::TransportType;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "FAROS_TUNNEL_";

/// 隧道时序参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// 控制通道心跳间隔
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// 单条控制消息写超时
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// 超过该时间未收到任何控制消息，认为对端已死
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// 单次 dial 的最长等待时间
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// 新连接发送 Hello 的最长等待时间
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// 每个对端 HTTP client 的空闲保留时间
    #[serde(with = "humantime_serde")]
    pub client_cache_ttl: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(90),
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            client_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl TunnelSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_interval.is_zero() {
            bail!("keepalive_interval must be greater than zero");
        }
        if self.read_timeout <= self.keepalive_interval {
            bail!(
                "read_timeout ({:?}) must be longer than keepalive_interval ({:?})",
                self.read_timeout,
                self.keepalive_interval
            );
        }
        if self.write_timeout.is_zero() || self.dial_timeout.is_zero() {
            bail!("write_timeout and dial_timeout must be greater than zero");
        }
        Ok(())
    }
}

fn default_server_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_upstream_authority() -> String {
    "localhost".to_string()
}

/// 服务器端（hub）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址（host:port）
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// TLS 证书路径（与 key_path 同时缺省则使用明文 TCP）
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 客户端 CA 证书路径；设置后 agent 必须出示由它签发的证书
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
    /// 转发请求时写入的 Host
    #[serde(default = "default_upstream_authority")]
    pub upstream_authority: String,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            cert_path: None,
            key_path: None,
            client_ca_path: None,
            upstream_authority: default_upstream_authority(),
            tunnel: TunnelSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn transport(&self) -> TransportType {
        if self.cert_path.is_some() {
            TransportType::Tls
        } else {
            TransportType::Tcp
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_addr.trim().is_empty() {
            bail!("server_addr cannot be empty");
        }
        match (&self.cert_path, &self.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted"),
        }
        if self.client_ca_path.is_some() && self.cert_path.is_none() {
            bail!("client_ca_path requires TLS (cert_path and key_path)");
        }
        self.tunnel.validate()
    }
}

fn default_cluster() -> String {
    "root".to_string()
}

/// 客户端（agent）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// hub 地址，例如 `https://hub.example.com:8443`
    pub upstream_url: String,
    /// 本地服务地址，pickup 得到的请求转发到这里
    pub downstream_url: String,
    /// 对端名称
    pub client_id: String,
    /// 所属逻辑集群
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// 命名空间（缺省与 cluster 相同）
    #[serde(default)]
    pub namespace: Option<String>,
    /// 客户端证书路径
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// 客户端证书私钥路径
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl ClientConfig {
    pub fn new(upstream_url: &str, downstream_url: &str, client_id: &str) -> Self {
        Self {
            upstream_url: upstream_url.to_string(),
            downstream_url: downstream_url.to_string(),
            client_id: client_id.to_string(),
            cluster: default_cluster(),
            namespace: None,
            client_cert_path: None,
            client_key_path: None,
            ca_cert_path: None,
            skip_verify: false,
            tunnel: TunnelSettings::default(),
        }
    }

    /// 该 agent 在 hub 上注册的身份
    pub fn peer_key(&self) -> PeerKey {
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| self.cluster.clone());
        PeerKey::new(namespace, self.client_id.clone(), self.cluster.clone())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let upstream = url::Url::parse(&self.upstream_url)
            .with_context(|| format!("Invalid upstream url: {}", self.upstream_url))?;
        if !matches!(upstream.scheme(), "https" | "tcp" | "tls") {
            bail!(
                "upstream url scheme must be https, tls or tcp, got '{}'",
                upstream.scheme()
            );
        }
        if upstream.host_str().is_none() {
            bail!("upstream url has no host: {}", self.upstream_url);
        }

        let downstream = url::Url::parse(&self.downstream_url)
            .with_context(|| format!("Invalid downstream url: {}", self.downstream_url))?;
        if downstream.scheme() != "http" {
            bail!("downstream url must use http, got '{}'", downstream.scheme());
        }

        if self.client_id.trim().is_empty() {
            bail!("client_id cannot be empty");
        }
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("client_cert_path and client_key_path must both be set, or both omitted"),
        }
        self.tunnel.validate()
    }
}

/// 应用配置
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerConfig> {
        #[derive(Deserialize)]
        struct ServerConfigWrapper {
            server: ServerConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        let wrapper: ServerConfigWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        #[derive(Deserialize)]
        struct ClientConfigWrapper {
            client: ClientConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        let wrapper: ClientConfigWrapper =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        wrapper
            .client
            .validate()
            .context("Client configuration validation failed")?;
        Ok(wrapper.client)
    }
}
