/// 隧道错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用方可以区分
/// "隧道基础设施已经不在了" 和 "只是这一次请求失败了"
use std::io;
use thiserror::Error;

/// 隧道核心的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 控制通道已关闭（对端断开或被主动关闭）
    #[error("tunneler.Dialer closed")]
    DialerClosed,

    /// 对端无法完成数据连接的 pickup
    #[error("pickup failed: {0}")]
    PickupFailed(String),

    /// 调用方取消
    #[error("operation cancelled")]
    Cancelled,

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 控制消息帧错误（协议没有重新同步点，属于致命错误）
    #[error("Framing error: {0}")]
    Framing(String),

    /// 握手错误
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// 隧道路径无效
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// HTTP 错误
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建 pickup 失败错误
    pub fn pickup_failed(msg: impl Into<String>) -> Self {
        Self::PickupFailed(msg.into())
    }

    /// 创建帧错误
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// 创建握手错误
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为通道关闭
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::DialerClosed)
    }

    /// 检查是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为对端报告的 pickup 失败
    pub fn is_pickup_failed(&self) -> bool {
        matches!(self, Self::PickupFailed(_))
    }
}
