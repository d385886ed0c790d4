use crate::config::{AppConfig, ClientConfig, ServerConfig};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reverse-proxy")]
#[command(author, version, about = "Reverse tunnel hub and agent", long_about = None)]
pub struct Cli {
    /// 运行模式
    #[arg(value_enum)]
    pub mode: Mode,

    /// 配置文件路径（TOML，命令行参数优先）
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<String>,

    /// 服务器 TLS 证书（cert 模式下为输出路径）
    #[arg(long = "certFile", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    /// 服务器 TLS 私钥（cert 模式下为输出路径）
    #[arg(long = "keyFile", value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// 客户端 CA 证书（server 模式，设置后要求 agent 出示客户端证书）
    #[arg(long = "clientCAFile", value_name = "PATH")]
    pub client_ca_file: Option<PathBuf>,

    /// 服务器监听地址
    #[arg(long = "serverAddress", value_name = "HOST:PORT")]
    pub server_address: Option<String>,

    /// 客户端证书
    #[arg(long = "clientCertFile", value_name = "PATH")]
    pub client_cert_file: Option<PathBuf>,

    /// 客户端证书私钥
    #[arg(long = "clientCertKeyFile", value_name = "PATH")]
    pub client_cert_key_file: Option<PathBuf>,

    /// hub 地址
    #[arg(long = "clientUpstreamUrl", value_name = "URL")]
    pub client_upstream_url: Option<String>,

    /// 本地服务地址
    #[arg(long = "clientDownstreamUrl", value_name = "URL")]
    pub client_downstream_url: Option<String>,

    /// 客户端 ID
    #[arg(long = "clientID", value_name = "ID")]
    pub client_id: Option<String>,

    /// 证书的 SubjectAltName（cert 模式，用逗号分隔多个）
    #[arg(long = "altNames", value_delimiter = ',', value_name = "DNS,...")]
    pub alt_names: Vec<String>,

    /// 日志详细程度（-v info, -vv debug, -vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 运行 agent
    Client,
    /// 运行 hub
    Server,
    /// 生成自签名证书
    Cert,
}

impl Cli {
    /// 合并配置文件和命令行参数，得到服务器配置
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load_server_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(addr) = &self.server_address {
            config.server_addr = addr.clone();
        }
        if let Some(cert) = &self.cert_file {
            config.cert_path = Some(cert.clone());
        }
        if let Some(key) = &self.key_file {
            config.key_path = Some(key.clone());
        }
        if let Some(ca) = &self.client_ca_file {
            config.client_ca_path = Some(ca.clone());
        }

        config
            .validate()
            .context("Server configuration validation failed")?;
        Ok(config)
    }

    /// 合并配置文件和命令行参数，得到客户端配置
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load_client_config(path)?,
            None => {
                let (Some(upstream), Some(downstream), Some(id)) = (
                    &self.client_upstream_url,
                    &self.client_downstream_url,
                    &self.client_id,
                ) else {
                    bail!("client mode requires --clientUpstreamUrl, --clientDownstreamUrl and --clientID (or --config)");
                };
                ClientConfig::new(upstream, downstream, id)
            }
        };

        if let Some(upstream) = &self.client_upstream_url {
            config.upstream_url = upstream.clone();
        }
        if let Some(downstream) = &self.client_downstream_url {
            config.downstream_url = downstream.clone();
        }
        if let Some(id) = &self.client_id {
            config.client_id = id.clone();
        }
        if let Some(cert) = &self.client_cert_file {
            config.client_cert_path = Some(cert.clone());
        }
        if let Some(key) = &self.client_cert_key_file {
            config.client_key_path = Some(key.clone());
        }

        config
            .validate()
            .context("Client configuration validation failed")?;
        Ok(config)
    }

    /// cert 模式的 Common Name：取监听地址的主机部分
    pub fn common_name(&self) -> String {
        self.server_address
            .as_deref()
            .and_then(|addr| addr.rsplit_once(':').map(|(host, _)| host))
            .filter(|host| !host.is_empty() && *host != "0.0.0.0")
            .unwrap_or("localhost")
            .to_string()
    }
}
