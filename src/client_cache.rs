/// 每个对端 HTTP client 的缓存
///
/// 滑动过期：每次命中都会刷新过期时间。每次 get/put 之后完整扫描一遍，
/// 过期的条目被移除并调用一次 `close_idle_connections()`。
/// 对端数量通常只有几十到几百个，O(n) 扫描可以接受。
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 可以释放空闲连接的 client
pub trait IdleConnections {
    fn close_idle_connections(&self);
}

/// 时钟函数，测试中可以替换
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

struct CacheEntry<C> {
    expires: Instant,
    client: C,
}

pub struct ClientCache<K, C> {
    ttl: Duration,
    now: Clock,
    entries: Mutex<HashMap<K, CacheEntry<C>>>,
}

impl<K, C> ClientCache<K, C>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    C: IdleConnections + Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(Instant::now))
    }

    pub fn with_clock(ttl: Duration, now: Clock) -> Self {
        Self {
            ttl,
            now,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 查找 client；命中时刷新过期时间
    ///
    /// 已经过期但尚未清理的条目视为未命中。
    pub fn get(&self, key: &K) -> Option<C> {
        let now = (self.now)();
        let (client, evicted) = {
            let mut entries = self.entries.lock();
            let client = match entries.get_mut(key) {
                Some(entry) if entry.expires > now => {
                    entry.expires = now + self.ttl;
                    Some(entry.client.clone())
                }
                _ => None,
            };
            (client, sweep(&mut entries, now))
        };
        close_all(evicted);
        client
    }

    /// 插入或覆盖 client
    ///
    /// 被覆盖的旧 client 同样会释放空闲连接。
    pub fn put(&self, key: K, client: C) {
        let now = (self.now)();
        let evicted = {
            let mut entries = self.entries.lock();
            let replaced = entries.insert(
                key,
                CacheEntry {
                    expires: now + self.ttl,
                    client,
                },
            );
            let mut evicted = sweep(&mut entries, now);
            evicted.extend(replaced.map(|entry| entry.client));
            evicted
        };
        close_all(evicted);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空缓存并释放所有 client 的空闲连接
    pub fn clear(&self) {
        let drained: Vec<C> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry.client).collect()
        };
        close_all(drained);
    }
}

/// 移除过期条目，返回被移除的 client（在锁外关闭）
fn sweep<K, C>(entries: &mut HashMap<K, CacheEntry<C>>, now: Instant) -> Vec<C>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    let expired: Vec<K> = entries
        .iter()
        .filter(|(_, entry)| entry.expires <= now)
        .map(|(key, _)| key.clone())
        .collect();

    expired
        .into_iter()
        .filter_map(|key| {
            debug!("Evicting idle client for {}", key);
            entries.remove(&key).map(|entry| entry.client)
        })
        .collect()
}

fn close_all<C: IdleConnections>(clients: Vec<C>) {
    for client in clients {
        client.close_idle_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_protocol::PeerKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingClient {
        closes: Arc<AtomicUsize>,
    }

    impl IdleConnections for CountingClient {
        fn close_idle_connections(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 手动推进的时钟
    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }

        fn clock(&self) -> Clock {
            let this = self.clone();
            Arc::new(move || this.base + *this.offset.lock())
        }
    }

    fn key(name: &str) -> PeerKey {
        PeerKey::new("ws1", name, "ws1")
    }

    #[test]
    fn test_hit_returns_same_client() {
        let cache = ClientCache::new(Duration::from_secs(60));
        let client = CountingClient::default();
        cache.put(key("a"), client.clone());

        let hit = cache.get(&key("a")).unwrap();
        assert!(Arc::ptr_eq(&hit.closes, &client.closes));
        assert!(cache.get(&key("b")).is_none());
    }

    #[test]
    fn test_expired_entry_is_evicted_once() {
        let clock = ManualClock::new();
        let cache = ClientCache::with_clock(Duration::from_millis(10), clock.clock());
        let client = CountingClient::default();
        cache.put(key("a"), client.clone());

        clock.advance(Duration::from_millis(11));

        assert!(cache.get(&key("a")).is_none());
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        // 再次扫描不会重复关闭
        cache.put(key("b"), CountingClient::default());
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_put_sweeps_other_entries() {
        let clock = ManualClock::new();
        let cache = ClientCache::with_clock(Duration::from_millis(10), clock.clock());
        let stale = CountingClient::default();
        cache.put(key("stale"), stale.clone());

        clock.advance(Duration::from_millis(20));
        cache.put(key("fresh"), CountingClient::default());

        assert_eq!(cache.len(), 1);
        assert_eq!(stale.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sliding_expiry() {
        let clock = ManualClock::new();
        let cache = ClientCache::with_clock(Duration::from_millis(10), clock.clock());
        let client = CountingClient::default();
        cache.put(key("a"), client.clone());

        for _ in 0..10 {
            clock.advance(Duration::from_millis(6));
            assert!(cache.get(&key("a")).is_some());
        }

        // 总共经过 60ms，远超 ttl，但一直被访问
        assert_eq!(client.closes.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(11));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overwrite_closes_previous_client() {
        let cache = ClientCache::new(Duration::from_secs(60));
        let first = CountingClient::default();
        cache.put(key("a"), first.clone());
        cache.put(key("a"), CountingClient::default());

        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_closes_all() {
        let cache = ClientCache::new(Duration::from_secs(60));
        let a = CountingClient::default();
        let b = CountingClient::default();
        cache.put(key("a"), a.clone());
        cache.put(key("b"), b.clone());

        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }
}
