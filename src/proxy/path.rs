/// 隧道路径
///
/// 对外路径：
/// `/services/faros-tunnels/<cluster>/apis/access.faros.sh/v1alpha1/access/<name>/proxy/...`
///
/// 转发给 agent 的路径：
/// `/services/syncer-tunnels/<cluster>/apis/workload.kcp.dev/v1alpha1/synctargets/<name>/proxy/...`
use crate::control_protocol::PeerKey;
use crate::error::{Result, TunnelError};

pub const FAROS_TUNNELS_PREFIX: &str = "/services/faros-tunnels";
pub const SYNCER_TUNNELS_PREFIX: &str = "/services/syncer-tunnels";

/// 路径中固定部分的最少段数（不含 proxy 之后的部分）
const MIN_SEGMENTS: usize = 9;

struct PathLayout {
    tunnels: &'static str,
    group: &'static str,
    version: &'static str,
    resource: &'static str,
}

const FAROS_LAYOUT: PathLayout = PathLayout {
    tunnels: "faros-tunnels",
    group: "access.faros.sh",
    version: "v1alpha1",
    resource: "access",
};

const SYNCER_LAYOUT: PathLayout = PathLayout {
    tunnels: "syncer-tunnels",
    group: "workload.kcp.dev",
    version: "v1alpha1",
    resource: "synctargets",
};

/// 返回 (cluster, name, rest)，rest 为 `proxy` 之后的部分（带前导 `/`，可能为空）
fn split<'a>(path: &'a str, layout: &PathLayout) -> Option<(&'a str, &'a str, &'a str)> {
    let trimmed = path.strip_prefix('/')?;
    let segments: Vec<&str> = trimmed.splitn(MIN_SEGMENTS + 1, '/').collect();
    if segments.len() < MIN_SEGMENTS {
        return None;
    }

    let literals_match = segments[0] == "services"
        && segments[1] == layout.tunnels
        && segments[3] == "apis"
        && segments[4] == layout.group
        && segments[5] == layout.version
        && segments[6] == layout.resource
        && segments[8] == "proxy";
    let (cluster, name) = (segments[2], segments[7]);
    if !literals_match || cluster.is_empty() || name.is_empty() {
        return None;
    }

    // rest 直接从原始字符串截取，保留末尾的 `/`
    let fixed_len: usize = segments[..MIN_SEGMENTS].iter().map(|s| s.len() + 1).sum();
    Some((cluster, name, &path[fixed_len..]))
}

/// 解析后的对外隧道路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPath {
    pub cluster: String,
    pub name: String,
    /// `proxy` 之后的部分
    pub rest: String,
}

impl TunnelPath {
    pub fn parse(path: &str) -> Result<Self> {
        let (cluster, name, rest) = split(path, &FAROS_LAYOUT)
            .ok_or_else(|| TunnelError::InvalidPath(path.to_string()))?;
        Ok(Self {
            cluster: cluster.to_string(),
            name: name.to_string(),
            rest: rest.to_string(),
        })
    }

    /// agent 所在集群中 namespace 与 cluster 相同
    pub fn peer_key(&self) -> PeerKey {
        PeerKey::new(self.cluster.as_str(), self.name.as_str(), self.cluster.as_str())
    }

    /// 转发给 agent 的路径
    pub fn rewritten(&self) -> String {
        format!(
            "{}/{}/apis/{}/{}/{}/{}/proxy{}",
            SYNCER_TUNNELS_PREFIX,
            self.cluster,
            SYNCER_LAYOUT.group,
            SYNCER_LAYOUT.version,
            SYNCER_LAYOUT.resource,
            self.name,
            self.rest
        )
    }
}

/// agent 侧：去掉 syncer-tunnels 前缀，得到本地服务的路径
///
/// 不匹配时返回 None。
pub fn strip_syncer_prefix(path: &str) -> Option<&str> {
    let (_, _, rest) = split(path, &SYNCER_LAYOUT)?;
    if rest.is_empty() {
        Some("/")
    } else {
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTHZ: &str =
        "/services/faros-tunnels/ws1/apis/access.faros.sh/v1alpha1/access/agent-7/proxy/healthz";

    #[test]
    fn test_parse_and_rewrite() {
        let path = TunnelPath::parse(HEALTHZ).unwrap();
        assert_eq!(path.cluster, "ws1");
        assert_eq!(path.name, "agent-7");
        assert_eq!(path.rest, "/healthz");
        assert_eq!(path.peer_key(), PeerKey::new("ws1", "agent-7", "ws1"));
        assert_eq!(
            path.rewritten(),
            "/services/syncer-tunnels/ws1/apis/workload.kcp.dev/v1alpha1/synctargets/agent-7/proxy/healthz"
        );
    }

    #[test]
    fn test_rest_keeps_nested_segments() {
        let path = TunnelPath::parse(
            "/services/faros-tunnels/root:org/apis/access.faros.sh/v1alpha1/access/a/proxy/api/v1/pods/",
        )
        .unwrap();
        assert_eq!(path.cluster, "root:org");
        assert_eq!(path.rest, "/api/v1/pods/");
    }

    #[test]
    fn test_bare_proxy_path() {
        let path = TunnelPath::parse(
            "/services/faros-tunnels/ws1/apis/access.faros.sh/v1alpha1/access/agent-7/proxy",
        )
        .unwrap();
        assert_eq!(path.rest, "");
        assert!(path.rewritten().ends_with("/synctargets/agent-7/proxy"));
    }

    #[test]
    fn test_invalid_paths() {
        for path in [
            "/",
            "/services/faros-tunnels/ws1",
            "/services/faros-tunnels/ws1/apis/access.faros.sh/v1alpha1/access/agent-7",
            "/services/other/ws1/apis/access.faros.sh/v1alpha1/access/agent-7/proxy",
            "/services/faros-tunnels//apis/access.faros.sh/v1alpha1/access/agent-7/proxy",
            "/services/faros-tunnels/ws1/apis/access.faros.sh/v1alpha1/access//proxy",
            "services/faros-tunnels/ws1/apis/access.faros.sh/v1alpha1/access/agent-7/proxy",
        ] {
            let err = TunnelPath::parse(path).unwrap_err();
            assert!(
                matches!(err, TunnelError::InvalidPath(_)),
                "{} should be invalid",
                path
            );
        }
    }

    #[test]
    fn test_strip_syncer_prefix() {
        let rewritten = TunnelPath::parse(HEALTHZ).unwrap().rewritten();
        assert_eq!(strip_syncer_prefix(&rewritten), Some("/healthz"));
        assert_eq!(
            strip_syncer_prefix(
                "/services/syncer-tunnels/ws1/apis/workload.kcp.dev/v1alpha1/synctargets/a/proxy"
            ),
            Some("/")
        );
        assert_eq!(strip_syncer_prefix(HEALTHZ), None);
    }
}
