/// 反向代理路由
///
/// 请求处理分两步：
///
/// 1. [`ReverseProxyRouter::director`] 解析对端、取得该对端的 client、改写请求；
///    出错时通过 [`ReverseProxyRouter::error`] 生成错误响应并放进请求扩展中。
/// 2. [`ReverseProxyRouter::round_trip`] 直接返回已生成的错误响应，
///    否则通过 client 发送请求。
mod client;
mod path;
mod resolver;

pub use client::PeerClient;
pub use path::{strip_syncer_prefix, TunnelPath, FAROS_TUNNELS_PREFIX, SYNCER_TUNNELS_PREFIX};
pub use resolver::{PeerResolver, ResolvedPeer, TunnelPathResolver};

use crate::client_cache::ClientCache;
use crate::config::TunnelSettings;
use crate::control_protocol::PeerKey;
use crate::server::TunnelRegistry;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 代理内部统一使用的 body 类型
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// upgrade 之后的长连接最多保留这么久，之后两端都会被强制关闭
pub const UPGRADED_CONNECTION_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// 逐跳头部，不转发给对端
const HOP_BY_HOP_HEADERS: &[header::HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// director 阶段生成的错误响应，保存在请求扩展中
#[derive(Debug, Clone)]
pub struct SyntheticError {
    pub status: StatusCode,
    pub message: String,
}

impl SyntheticError {
    pub fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(full(self.message));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub struct ReverseProxyRouter {
    registry: Arc<TunnelRegistry>,
    resolver: Arc<dyn PeerResolver>,
    clients: ClientCache<PeerKey, PeerClient>,
    upstream_authority: String,
}

impl ReverseProxyRouter {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        resolver: Arc<dyn PeerResolver>,
        upstream_authority: impl Into<String>,
        settings: &TunnelSettings,
    ) -> Self {
        Self::with_client_cache(
            registry,
            resolver,
            upstream_authority,
            ClientCache::new(settings.client_cache_ttl),
        )
    }

    pub fn with_client_cache(
        registry: Arc<TunnelRegistry>,
        resolver: Arc<dyn PeerResolver>,
        upstream_authority: impl Into<String>,
        clients: ClientCache<PeerKey, PeerClient>,
    ) -> Self {
        Self {
            registry,
            resolver,
            clients,
            upstream_authority: upstream_authority.into(),
        }
    }

    pub fn client_cache(&self) -> &ClientCache<PeerKey, PeerClient> {
        &self.clients
    }

    /// 解析对端并改写请求
    ///
    /// 失败时不返回错误，而是把错误响应放进请求扩展，由 round_trip 直接返回。
    pub async fn director(&self, req: &mut Request<ProxyBody>) {
        let resolved = match self.resolver.resolve(req.uri().path()).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                let message = format!("forbidden: no tunnel peer for {}", req.uri().path());
                self.error(req, StatusCode::FORBIDDEN, message);
                return;
            }
            Err(e) => {
                self.error(req, StatusCode::INTERNAL_SERVER_ERROR, e);
                return;
            }
        };

        let Some(client) = self.client_for(&resolved.key) else {
            let message = format!("no tunnel connected for {}", resolved.key);
            self.error(req, StatusCode::SERVICE_UNAVAILABLE, message);
            return;
        };

        let mut target = format!(
            "http://{}{}",
            self.upstream_authority,
            resolved.path.rewritten()
        );
        if let Some(query) = req.uri().query() {
            target.push('?');
            target.push_str(query);
        }
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                self.error(req, StatusCode::INTERNAL_SERVER_ERROR, format!("invalid path: {}", e));
                return;
            }
        };

        debug!(
            "[{}] {} {} -> {}",
            resolved.key,
            req.method(),
            req.uri().path(),
            uri.path()
        );

        let upgrade = is_upgrade_request(req.headers());
        *req.uri_mut() = uri;
        let headers = req.headers_mut();
        headers.remove(header::AUTHORIZATION);
        strip_hop_by_hop(headers, upgrade);
        if let Ok(host) = HeaderValue::from_str(&self.upstream_authority) {
            headers.insert(header::HOST, host);
        }

        req.extensions_mut().insert(client);
    }

    /// 取缓存的 client；只有绑定到当前注册的 Dialer 时才算命中
    fn client_for(&self, key: &PeerKey) -> Option<PeerClient> {
        let dialer = self.registry.get(key)?;
        if let Some(client) = self.clients.get(key) {
            if Arc::ptr_eq(client.dialer(), &dialer) {
                return Some(client);
            }
        }

        let client = PeerClient::new(dialer);
        self.clients.put(key.clone(), client.clone());
        Some(client)
    }

    /// 生成错误响应并放进请求扩展
    pub fn error<B>(&self, req: &mut Request<B>, status: StatusCode, err: impl fmt::Display) {
        let message = err.to_string();
        warn!(
            "Proxy error for {} {}: {} {}",
            req.method(),
            req.uri().path(),
            status.as_u16(),
            message
        );
        req.extensions_mut()
            .insert(SyntheticError { status, message });
    }

    /// 发送请求；upgrade 成功时在后台桥接两端
    pub async fn round_trip(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        if let Some(err) = req.extensions_mut().remove::<SyntheticError>() {
            return err.into_response();
        }
        let Some(client) = req.extensions_mut().remove::<PeerClient>() else {
            return SyntheticError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "no tunnel client resolved for request".to_string(),
            }
            .into_response();
        };

        let inbound_upgrade = is_upgrade_request(req.headers())
            .then(|| req.extensions_mut().remove::<OnUpgrade>())
            .flatten();

        let mut response = match client.send(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Tunnel round trip failed: {}", client.dialer().peer(), e);
                return SyntheticError {
                    status: StatusCode::BAD_GATEWAY,
                    message: format!("bad gateway: {}", e),
                }
                .into_response();
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match inbound_upgrade {
                Some(inbound) => {
                    let outbound = hyper::upgrade::on(&mut response);
                    tokio::spawn(bridge_upgrade(inbound, outbound, UPGRADED_CONNECTION_CEILING));
                }
                None => warn!(
                    "[{}] Peer switched protocols on a request that cannot be upgraded",
                    client.dialer().peer()
                ),
            }
        }

        response.map(|body| body.map_err(BoxError::from).boxed_unsync())
    }

    /// director + round_trip，作为 hyper service 使用
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut req = req.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync());
        self.director(&mut req).await;
        self.round_trip(req).await
    }
}

/// 移除逐跳头部；upgrade 请求保留 Connection 和 Upgrade
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap, upgrade: bool) {
    if !upgrade {
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(name);
        }
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// 桥接 upgrade 之后的两端，超过 ceiling 后强制关闭
pub(crate) async fn bridge_upgrade(inbound: OnUpgrade, outbound: OnUpgrade, ceiling: Duration) {
    let (inbound, outbound) = match tokio::try_join!(inbound, outbound) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("Upgrade failed: {}", e);
            return;
        }
    };

    bridge_streams(TokioIo::new(inbound), TokioIo::new(outbound), ceiling).await
}

/// 双向复制直到任一端关闭或超过 ceiling；返回时两端都被丢弃
pub(crate) async fn bridge_streams<A, B>(mut inbound: A, mut outbound: B, ceiling: Duration)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(
        ceiling,
        tokio::io::copy_bidirectional(&mut inbound, &mut outbound),
    )
    .await
    {
        Ok(Ok((to_peer, from_peer))) => {
            debug!(
                "Upgraded connection finished ({} bytes out, {} bytes in)",
                to_peer, from_peer
            );
        }
        Ok(Err(e)) => debug!("Upgraded connection closed: {}", e),
        Err(_) => warn!("Closing upgraded connection after {:?}", ceiling),
    }
}
