/// agent 侧 Listener
///
/// 与 [`crate::dialer::Dialer`] 对称：建立控制连接后，每收到一个 `conn-ready`
/// 就向 hub 发起一次 pickup 连接，成功后通过 [`Listener::accept`] 交给本地服务；
/// 失败时在同一条控制通道上回复 `pickup-failed`，让 hub 侧的 dial 立即返回。
use crate::config::TunnelSettings;
use crate::control_channel::{ControlChannel, ControlEvent};
use crate::control_protocol::{ControlMessage, Hello, PeerKey};
use crate::error::{Result, TunnelError};
use crate::transport::{Conn, TransportClient};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// 已 pickup 但尚未被 accept 的连接数量上限
const ACCEPT_BACKLOG: usize = 64;

pub struct Listener {
    peer: PeerKey,
    channel: ControlChannel,
    accepted: Mutex<mpsc::Receiver<Conn>>,
}

impl Listener {
    /// 连接 hub 并注册为 `peer`
    pub async fn connect(
        connector: Arc<dyn TransportClient>,
        peer: PeerKey,
        settings: &TunnelSettings,
    ) -> Result<Self> {
        let hello = Hello::Control { peer: peer.clone() };
        let conn = open_with_hello(connector.as_ref(), &hello, settings.handshake_timeout)
            .await
            .map_err(TunnelError::Other)?;

        let (channel, events) = ControlChannel::spawn(conn, settings, peer.to_string());
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);

        tokio::spawn(pickup_loop(
            connector,
            channel.clone(),
            events,
            accepted_tx,
            settings.handshake_timeout,
        ));

        info!("[{}] Control channel established", peer);

        Ok(Self {
            peer,
            channel,
            accepted: Mutex::new(accepted_rx),
        })
    }

    /// 等待下一条 pickup 成功的连接
    ///
    /// 控制通道关闭后返回 `DialerClosed`。
    pub async fn accept(&self) -> Result<Conn> {
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            biased;
            conn = accepted.recv() => conn.ok_or(TunnelError::DialerClosed),
            _ = self.channel.closed() => Err(TunnelError::DialerClosed),
        }
    }

    pub fn peer(&self) -> &PeerKey {
        &self.peer
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

impl Drop for Listener {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// 打开一条新连接并发送 Hello 行
async fn open_with_hello(
    connector: &dyn TransportClient,
    hello: &Hello,
    timeout: Duration,
) -> anyhow::Result<Conn> {
    let line = hello.encode_line()?;
    let handshake = async {
        let mut conn = connector.connect().await?;
        conn.write_all(line.as_bytes())
            .await
            .context("Failed to send hello")?;
        conn.flush().await.context("Failed to flush hello")?;
        anyhow::Ok(conn)
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {:?} opening tunnel connection", timeout))?
}

async fn pickup_loop(
    connector: Arc<dyn TransportClient>,
    channel: ControlChannel,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
    accepted: mpsc::Sender<Conn>,
    timeout: Duration,
) {
    let shutdown = channel.shutdown_token();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(ControlEvent::ConnReady { id, conn_path }) => {
                let connector = connector.clone();
                let channel = channel.clone();
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    pickup(connector, channel, accepted, id, conn_path, timeout).await;
                });
            }
            Some(ControlEvent::PickupFailed { id, err }) => {
                warn!(
                    "[{}] Ignoring unexpected pickup-failed {:?}: {}",
                    channel.label(),
                    id,
                    err
                );
            }
            None => break,
        }
    }

    debug!("[{}] Pickup loop stopped", channel.label());
}

/// 对一个 conn-ready 只尝试一次 pickup
async fn pickup(
    connector: Arc<dyn TransportClient>,
    channel: ControlChannel,
    accepted: mpsc::Sender<Conn>,
    id: Option<u64>,
    conn_path: String,
    timeout: Duration,
) {
    let hello = Hello::Pickup {
        conn_path: conn_path.clone(),
    };

    match open_with_hello(connector.as_ref(), &hello, timeout).await {
        Ok(conn) => {
            debug!("[{}] Picked up {}", channel.label(), conn_path);
            if accepted.send(conn).await.is_err() {
                debug!("[{}] Listener dropped, discarding {}", channel.label(), conn_path);
            }
        }
        Err(e) => {
            let err = format!("{:#}", e);
            warn!(
                "[{}] Failed to pick up {}: {}",
                channel.label(),
                conn_path,
                err
            );
            if let Err(e) = channel.send(ControlMessage::pickup_failed(id, err)).await {
                debug!("[{}] Could not report pickup failure: {}", channel.label(), e);
            }
        }
    }
}
