use crate::control_protocol::{PeerKey, PickupPath};
use crate::dialer::Dialer;
use crate::transport::Conn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryInner {
    by_peer: HashMap<PeerKey, Arc<Dialer>>,
    /// pickup 连接只携带 token，通过它找到对应的 Dialer
    by_token: HashMap<String, PeerKey>,
}

/// 隧道注册表，维护 PeerKey -> Dialer 的映射
///
/// 显式创建并注入到 server 和 router 中，不使用全局状态。
#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册一个新的 Dialer
    ///
    /// 同一对端已有的 Dialer 会被替换并关闭。Dialer 关闭后自动注销。
    pub fn register(self: &Arc<Self>, dialer: Arc<Dialer>) {
        let peer = dialer.peer().clone();
        let previous = {
            let mut inner = self.inner.write();
            let previous = inner.by_peer.insert(peer.clone(), dialer.clone());
            if let Some(ref old) = previous {
                inner.by_token.remove(old.token());
            }
            inner
                .by_token
                .insert(dialer.token().to_string(), peer.clone());
            previous
        };

        if let Some(old) = previous {
            warn!("[{}] Replacing existing tunnel", peer);
            old.close();
        } else {
            info!("[{}] Tunnel registered", peer);
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            dialer.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_current(&dialer);
            }
        });
    }

    /// 仅当注册的仍是该实例时才移除
    fn remove_if_current(&self, dialer: &Arc<Dialer>) {
        let mut inner = self.inner.write();
        let is_current = inner
            .by_peer
            .get(dialer.peer())
            .is_some_and(|current| Arc::ptr_eq(current, dialer));
        if is_current {
            inner.by_peer.remove(dialer.peer());
            inner.by_token.remove(dialer.token());
            info!("[{}] Tunnel unregistered", dialer.peer());
        }
    }

    pub fn get(&self, peer: &PeerKey) -> Option<Arc<Dialer>> {
        self.inner.read().by_peer.get(peer).cloned()
    }

    pub fn get_by_token(&self, token: &str) -> Option<Arc<Dialer>> {
        let inner = self.inner.read();
        let peer = inner.by_token.get(token)?;
        inner.by_peer.get(peer).cloned()
    }

    /// 将 pickup 连接交给等待它的 dial
    ///
    /// 返回 false 表示路径无效、Dialer 不存在或对应的 dial 已放弃，连接被丢弃。
    pub fn deliver_pickup(&self, conn_path: &str, conn: Conn) -> bool {
        let path: PickupPath = match conn_path.parse() {
            Ok(path) => path,
            Err(e) => {
                warn!("Rejecting pickup connection: {}", e);
                return false;
            }
        };

        match self.get_by_token(&path.token) {
            Some(dialer) => dialer.deliver(path.id, conn),
            None => {
                debug!("No tunnel for pickup {}, dropping connection", conn_path);
                false
            }
        }
    }

    /// 移除并关闭对端的 Dialer
    pub fn remove(&self, peer: &PeerKey) -> Option<Arc<Dialer>> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.by_peer.remove(peer);
            if let Some(ref dialer) = removed {
                inner.by_token.remove(dialer.token());
            }
            removed
        };
        if let Some(ref dialer) = removed {
            dialer.close();
        }
        removed
    }

    pub fn peers(&self) -> Vec<PeerKey> {
        let mut peers: Vec<_> = self.inner.read().by_peer.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelSettings;
    use crate::control_channel::ControlChannel;
    use std::time::Duration;

    fn dialer_for(peer: &PeerKey) -> (Arc<Dialer>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let settings = TunnelSettings::default();
        let (channel, events) = ControlChannel::spawn(ours, &settings, peer.to_string());
        (Dialer::new(peer.clone(), channel, events, &settings), theirs)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TunnelRegistry::new();
        let peer = PeerKey::new("ws1", "agent-1", "ws1");
        let (dialer, _remote) = dialer_for(&peer);

        registry.register(dialer.clone());

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&peer).unwrap(), &dialer));
        assert!(Arc::ptr_eq(
            &registry.get_by_token(dialer.token()).unwrap(),
            &dialer
        ));
        assert_eq!(registry.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_closed_dialer_is_removed() {
        let registry = TunnelRegistry::new();
        let peer = PeerKey::new("ws1", "agent-1", "ws1");
        let (dialer, remote) = dialer_for(&peer);
        let token = dialer.token().to_string();
        registry.register(dialer);

        drop(remote);

        wait_for(|| registry.is_empty()).await;
        assert!(registry.get_by_token(&token).is_none());
    }

    #[tokio::test]
    async fn test_replacing_closes_previous() {
        let registry = TunnelRegistry::new();
        let peer = PeerKey::new("ws1", "agent-1", "ws1");
        let (first, _first_remote) = dialer_for(&peer);
        let (second, _second_remote) = dialer_for(&peer);

        registry.register(first.clone());
        registry.register(second.clone());

        assert!(first.is_closed());
        // 旧实例的注销任务不能移除新实例
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(Arc::ptr_eq(&registry.get(&peer).unwrap(), &second));
        assert!(registry.get_by_token(first.token()).is_none());
    }

    #[tokio::test]
    async fn test_deliver_pickup_rejects_unknown_paths() {
        let registry = TunnelRegistry::new();
        let (conn, _other) = tokio::io::duplex(64);
        assert!(!registry.deliver_pickup("/not-a-pickup", Box::pin(conn)));

        let (conn, _other) = tokio::io::duplex(64);
        assert!(!registry.deliver_pickup("/pickup/unknown/1", Box::pin(conn)));
    }

    #[tokio::test]
    async fn test_remove_closes_dialer() {
        let registry = TunnelRegistry::new();
        let peer = PeerKey::new("ws1", "agent-1", "ws1");
        let (dialer, _remote) = dialer_for(&peer);
        registry.register(dialer.clone());

        let removed = registry.remove(&peer).unwrap();
        assert!(Arc::ptr_eq(&removed, &dialer));
        assert!(dialer.is_closed());
        assert!(registry.is_empty());
    }
}
