/// 绑定到某个对端 Dialer 的 HTTP/1 client
///
/// 每条底层连接都是一次 `Dialer::dial`，空闲的 sender 保留下来复用。
use super::ProxyBody;
use crate::client_cache::IdleConnections;
use crate::dialer::Dialer;
use crate::error::Result;
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// 每个对端最多保留的空闲连接数
const DEFAULT_MAX_IDLE: usize = 8;

struct Inner {
    dialer: Arc<Dialer>,
    idle: Mutex<Vec<http1::SendRequest<ProxyBody>>>,
    max_idle: usize,
}

#[derive(Clone)]
pub struct PeerClient {
    inner: Arc<Inner>,
}

impl PeerClient {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                idle: Mutex::new(Vec::new()),
                max_idle: DEFAULT_MAX_IDLE,
            }),
        }
    }

    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.inner.dialer
    }

    /// 当前保留的连接数（包括正在读响应体的连接）
    pub fn pooled_connections(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// 发送请求
    ///
    /// 请求 URI 转为 origin-form 后发送；101 响应所在的连接交给 upgrade，不再放回池中。
    pub async fn send(&self, mut req: Request<ProxyBody>) -> Result<Response<Incoming>> {
        if let Some(path_and_query) = req.uri().path_and_query().cloned() {
            *req.uri_mut() = Uri::from(path_and_query);
        }

        let mut sender = match self.checkout() {
            Some(sender) => sender,
            None => self.connect().await?,
        };

        sender.ready().await?;
        let response = sender.send_request(req).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            self.checkin(sender);
        }
        Ok(response)
    }

    fn checkout(&self) -> Option<http1::SendRequest<ProxyBody>> {
        let mut idle = self.inner.idle.lock();
        idle.retain(|sender| !sender.is_closed());
        let ready = idle.iter().position(|sender| sender.is_ready())?;
        Some(idle.swap_remove(ready))
    }

    fn checkin(&self, sender: http1::SendRequest<ProxyBody>) {
        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.max_idle {
            idle.push(sender);
        }
    }

    async fn connect(&self) -> Result<http1::SendRequest<ProxyBody>> {
        let dialer = &self.inner.dialer;
        let conn = dialer.dial("tcp", &dialer.peer().to_string()).await?;
        let (sender, connection) = http1::handshake(TokioIo::new(conn)).await?;

        let peer = dialer.peer().clone();
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!("[{}] Tunnel HTTP connection closed: {}", peer, e);
            }
        });

        Ok(sender)
    }
}

impl IdleConnections for PeerClient {
    fn close_idle_connections(&self) {
        let dropped = std::mem::take(&mut *self.inner.idle.lock());
        if !dropped.is_empty() {
            debug!(
                "[{}] Closing {} idle tunnel connections",
                self.inner.dialer.peer(),
                dropped.len()
            );
        }
    }
}
