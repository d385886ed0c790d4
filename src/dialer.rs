/// hub 侧 Dialer
///
/// 把一次逻辑 dial 变成从远端对端取回的一条物理连接：
/// 通过控制通道发送 `conn-ready`，等待对端用新连接来 pickup，
/// 然后把这条连接原样交给调用方。
///
/// 每次 dial 分配一个单调递增的请求 ID，pending 表按 ID 索引，
/// 因此同一条控制通道上可以同时有多个 dial 在等待。
use crate::config::TunnelSettings;
use crate::control_channel::{ControlChannel, ControlEvent};
use crate::control_protocol::{ControlMessage, PeerKey, PickupPath};
use crate::error::{Result, TunnelError};
use crate::transport::Conn;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PendingDials = Arc<Mutex<BTreeMap<u64, oneshot::Sender<Result<Conn>>>>>;

pub struct Dialer {
    peer: PeerKey,
    token: String,
    channel: ControlChannel,
    pending: PendingDials,
    next_id: AtomicU64,
    dial_timeout: Duration,
}

/// dial future 被丢弃或返回时移除对应的 pending 项
struct PendingGuard<'a> {
    pending: &'a PendingDials,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl Dialer {
    /// 基于已经建立的控制通道创建 Dialer，并启动事件分发任务
    pub fn new(
        peer: PeerKey,
        channel: ControlChannel,
        events: mpsc::UnboundedReceiver<ControlEvent>,
        settings: &TunnelSettings,
    ) -> Arc<Self> {
        let pending: PendingDials = Arc::new(Mutex::new(BTreeMap::new()));
        let token = uuid::Uuid::new_v4().simple().to_string();

        tokio::spawn(dispatch_events(
            pending.clone(),
            events,
            channel.shutdown_token(),
            peer.to_string(),
        ));

        Arc::new(Self {
            peer,
            token,
            channel,
            pending,
            next_id: AtomicU64::new(1),
            dial_timeout: settings.dial_timeout,
        })
    }

    /// 请求一条新的数据连接
    ///
    /// network / address 仅用于日志：连接总是由对端决定的 pickup 产生。
    /// 丢弃返回的 future 即取消本次 dial。
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn> {
        match tokio::time::timeout(self.dial_timeout, self.dial_inner(network, address)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "[{}] Dial {}/{} timed out after {:?}",
                    self.peer, network, address, self.dial_timeout
                );
                Err(TunnelError::timeout(self.dial_timeout))
            }
        }
    }

    /// 与 [`Dialer::dial`] 相同，但可以通过 token 取消，取消时返回 `Cancelled`
    pub async fn dial_with_cancel(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<Conn> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = self.dial(network, address) => result,
        }
    }

    async fn dial_inner(&self, network: &str, address: &str) -> Result<Conn> {
        if self.channel.is_closed() {
            return Err(TunnelError::DialerClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn_tx, conn_rx) = oneshot::channel();
        self.pending.lock().insert(id, conn_tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let conn_path = PickupPath::new(self.token.as_str(), id).to_string();
        debug!(
            "[{}] Requesting connection #{} for {}/{}",
            self.peer, id, network, address
        );
        self.channel
            .send(ControlMessage::conn_ready(id, conn_path))
            .await?;

        tokio::select! {
            biased;
            result = conn_rx => match result {
                Ok(result) => result,
                Err(_) => Err(TunnelError::DialerClosed),
            },
            _ = self.channel.closed() => Err(TunnelError::DialerClosed),
        }
    }

    /// 交付对端 pickup 的连接
    ///
    /// 返回 false 表示没有对应的等待者（已取消或已超时），连接会被直接丢弃。
    pub fn deliver(&self, id: u64, conn: Conn) -> bool {
        let Some(waiter) = self.pending.lock().remove(&id) else {
            debug!("[{}] Dropping pickup #{} with no pending dial", self.peer, id);
            return false;
        };
        waiter.send(Ok(conn)).is_ok()
    }

    pub fn peer(&self) -> &PeerKey {
        &self.peer
    }

    /// 标识该 Dialer 实例的 pickup token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// 当前等待中的 dial 数量
    pub fn pending_dials(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub async fn closed(&self) {
        self.channel.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// 把对端报告的 pickup 失败交给对应的等待者；通道关闭时让所有等待者失败
async fn dispatch_events(
    pending: PendingDials,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
    shutdown: CancellationToken,
    peer: String,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(ControlEvent::PickupFailed { id, err }) => {
                warn!("[{}] Peer failed to pick up connection {:?}: {}", peer, id, err);
                let waiter = {
                    let mut pending = pending.lock();
                    match id {
                        Some(id) => pending.remove(&id),
                        // 没有 ID 的旧格式消息：失败最早的一个请求
                        None => pending.pop_first().map(|(_, waiter)| waiter),
                    }
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(TunnelError::pickup_failed(err)));
                }
            }
            Some(ControlEvent::ConnReady { conn_path, .. }) => {
                warn!("[{}] Ignoring unexpected conn-ready ({})", peer, conn_path);
            }
            None => break,
        }
    }

    let waiters = std::mem::take(&mut *pending.lock());
    if !waiters.is_empty() {
        info!(
            "[{}] Control channel closed with {} pending dials",
            peer,
            waiters.len()
        );
    }
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(TunnelError::DialerClosed));
    }
}
