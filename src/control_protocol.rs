/// 控制通道协议
///
/// 每条控制消息是一个 JSON 对象，以 `\n` 结尾（一行一条消息），
/// 例如：
///
/// ```text
/// {"command":"keep-alive"}
/// {"command":"conn-ready","connPath":"/pickup/<token>/7","id":7}
/// {"command":"pickup-failed","err":"connection refused","id":7}
/// ```
///
/// 新建的物理连接在进入控制通道或数据转发之前，先由 agent 发送一行 [`Hello`]。
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 单行控制消息的最大长度
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// pickup 路径前缀
pub const PICKUP_PATH_PREFIX: &str = "/pickup";

/// 控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// 心跳
    KeepAlive,
    /// 请求对端建立新的数据连接
    ConnReady,
    /// 对端无法建立请求的数据连接
    PickupFailed,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::KeepAlive => "keep-alive",
            Command::ConnReady => "conn-ready",
            Command::PickupFailed => "pickup-failed",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 控制消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub command: Command,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    /// 请求 ID（用于在同一控制通道上复用多个 dial）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl ControlMessage {
    pub fn keep_alive() -> Self {
        Self {
            command: Command::KeepAlive,
            conn_path: None,
            err: None,
            id: None,
        }
    }

    pub fn conn_ready(id: u64, conn_path: String) -> Self {
        Self {
            command: Command::ConnReady,
            conn_path: Some(conn_path),
            err: None,
            id: Some(id),
        }
    }

    pub fn pickup_failed(id: Option<u64>, err: impl Into<String>) -> Self {
        Self {
            command: Command::PickupFailed,
            conn_path: None,
            err: Some(err.into()),
            id,
        }
    }

    /// 编码为一行（不含结尾换行符，由 LinesCodec 追加）
    ///
    /// serde_json 会转义字符串中的控制字符，因此结果中不会出现原始换行符。
    pub fn encode_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TunnelError::framing(format!("failed to encode control message: {}", e)))
    }

    /// 解析一行控制消息
    pub fn decode_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end_matches('\r'))
            .map_err(|e| TunnelError::framing(format!("malformed control message: {}", e)))
    }
}

/// 对端身份（namespace, name, cluster）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey {
    pub namespace: String,
    pub name: String,
    pub cluster: String,
}

impl PeerKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// 新物理连接的第一行：声明该连接的用途
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Hello {
    /// 控制连接
    Control { peer: PeerKey },
    /// 响应 conn-ready 的数据连接
    Pickup {
        #[serde(rename = "connPath")]
        conn_path: String,
    },
}

impl Hello {
    pub fn encode_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| TunnelError::handshake(format!("failed to encode hello: {}", e)))?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode_line(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line)
            .map_err(|e| TunnelError::handshake(format!("malformed hello: {}", e)))
    }
}

/// pickup 路径：`/pickup/<token>/<id>`
///
/// token 标识 Dialer 实例，id 标识该 Dialer 上的某次 dial。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickupPath {
    pub token: String,
    pub id: u64,
}

impl PickupPath {
    pub fn new(token: impl Into<String>, id: u64) -> Self {
        Self {
            token: token.into(),
            id,
        }
    }
}

impl fmt::Display for PickupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", PICKUP_PATH_PREFIX, self.token, self.id)
    }
}

impl FromStr for PickupPath {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TunnelError::handshake(format!("invalid pickup path: {}", s));

        let rest = s.strip_prefix(PICKUP_PATH_PREFIX).ok_or_else(invalid)?;
        let mut parts = rest.trim_start_matches('/').split('/');
        let token = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;
        let id = parts
            .next()
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(token, id))
    }
}
