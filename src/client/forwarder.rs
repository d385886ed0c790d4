/// 把 pickup 得到的连接作为 HTTP/1 服务，请求转发到本地 downstream 服务
use crate::proxy::{
    bridge_upgrade, full, is_upgrade_request, strip_hop_by_hop, strip_syncer_prefix, BoxError,
    ProxyBody, UPGRADED_CONNECTION_CEILING,
};
use crate::transport::Conn;
use anyhow::{bail, Context};
use http::header::{self, HeaderValue};
use http::uri::Authority;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DownstreamForwarder {
    authority: Authority,
    /// downstream url 中的路径前缀（不带结尾的 `/`）
    base_path: String,
    client: Client<HttpConnector, ProxyBody>,
}

impl DownstreamForwarder {
    pub fn new(downstream_url: &str) -> anyhow::Result<Self> {
        let uri: Uri = downstream_url
            .parse()
            .with_context(|| format!("Invalid downstream url: {}", downstream_url))?;
        if uri.scheme_str() != Some("http") {
            bail!("downstream url must use http: {}", downstream_url);
        }
        let authority = uri
            .authority()
            .cloned()
            .context("Downstream url has no host")?;

        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// 在一条 pickup 连接上提供 HTTP 服务，直到连接关闭
    pub async fn serve(self: Arc<Self>, conn: Conn) {
        let forwarder = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let forwarder = Arc::clone(&forwarder);
            async move { Ok::<_, Infallible>(forwarder.forward(req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(conn), service)
            .with_upgrades()
            .await
        {
            debug!("Tunnel HTTP connection ended with error: {}", e);
        }
    }

    /// 改写后的 downstream 地址；不是隧道路径时返回 None
    fn target(&self, uri: &Uri) -> Option<Uri> {
        let path = strip_syncer_prefix(uri.path())?;
        let mut target = format!("http://{}{}{}", self.authority, self.base_path, path);
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }
        target.parse().ok()
    }

    pub async fn forward<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let Some(target) = self.target(req.uri()) else {
            debug!("Rejecting non-tunnel path {}", req.uri().path());
            return plain(StatusCode::NOT_FOUND, format!("not a tunnel path: {}", req.uri().path()));
        };

        let mut req = req.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync());
        let upgrade = is_upgrade_request(req.headers());
        let inbound_upgrade = if upgrade {
            req.extensions_mut().remove::<OnUpgrade>()
        } else {
            None
        };

        debug!("{} {} -> {}", req.method(), req.uri().path(), target);
        *req.uri_mut() = target;
        let headers = req.headers_mut();
        strip_hop_by_hop(headers, upgrade);
        if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
            headers.insert(header::HOST, host);
        }

        let mut response = match self.client.request(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Downstream request to {} failed: {}", self.authority, e);
                return plain(StatusCode::BAD_GATEWAY, format!("bad gateway: {}", e));
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(inbound) = inbound_upgrade {
                let outbound = hyper::upgrade::on(&mut response);
                tokio::spawn(bridge_upgrade(inbound, outbound, UPGRADED_CONNECTION_CEILING));
            }
        }

        response.map(|body| body.map_err(BoxError::from).boxed_unsync())
    }
}

fn plain(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response
}
