use super::path::TunnelPath;
use crate::control_protocol::PeerKey;
use crate::error::Result;
use async_trait::async_trait;

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub key: PeerKey,
    pub path: TunnelPath,
}

/// 把请求路径映射到对端
///
/// - `Err`：路径本身无法解析
/// - `Ok(None)`：路径合法，但调用方无权访问或对端不存在
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn resolve(&self, path: &str) -> Result<Option<ResolvedPeer>>;
}

/// 默认解析器：直接从路径推导对端身份
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelPathResolver;

#[async_trait]
impl PeerResolver for TunnelPathResolver {
    async fn resolve(&self, path: &str) -> Result<Option<ResolvedPeer>> {
        let path = TunnelPath::parse(path)?;
        Ok(Some(ResolvedPeer {
            key: path.peer_key(),
            path,
        }))
    }
}
