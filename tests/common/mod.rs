//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use faros_tunnel::config::TunnelSettings;
use faros_tunnel::proxy::{PeerResolver, ReverseProxyRouter, TunnelPathResolver};
use faros_tunnel::server::{TunnelRegistry, TunnelServer};
use faros_tunnel::transport::{Conn, TransportClient, TransportType};
use faros_tunnel::PeerKey;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const HEALTHZ: &str =
    "/services/faros-tunnels/ws1/apis/access.faros.sh/v1alpha1/access/agent-7/proxy/healthz";

pub const REWRITTEN_HEALTHZ: &str =
    "/services/syncer-tunnels/ws1/apis/workload.kcp.dev/v1alpha1/synctargets/agent-7/proxy/healthz";

pub fn agent_peer() -> PeerKey {
    PeerKey::new("ws1", "agent-7", "ws1")
}

/// Build a hub with the default path resolver
pub fn hub(settings: TunnelSettings) -> (Arc<TunnelServer>, Arc<TunnelRegistry>) {
    hub_with_resolver(settings, Arc::new(TunnelPathResolver))
}

pub fn hub_with_resolver(
    settings: TunnelSettings,
    resolver: Arc<dyn PeerResolver>,
) -> (Arc<TunnelServer>, Arc<TunnelRegistry>) {
    let registry = TunnelRegistry::new();
    let router = Arc::new(ReverseProxyRouter::new(
        registry.clone(),
        resolver,
        "hub.internal",
        &settings,
    ));
    let server = Arc::new(TunnelServer::new(registry.clone(), router, settings));
    (server, registry)
}

/// Connects agents to an in-process hub over in-memory pipes
#[derive(Clone)]
pub struct MemoryConnector {
    server: Arc<TunnelServer>,
}

impl MemoryConnector {
    pub fn new(server: Arc<TunnelServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl TransportClient for MemoryConnector {
    async fn connect(&self) -> anyhow::Result<Conn> {
        let (agent_side, hub_side) = tokio::io::duplex(256 * 1024);
        let server = self.server.clone();
        tokio::spawn(async move {
            let _ = server.handle_connection(Box::pin(hub_side)).await;
        });
        Ok(Box::pin(agent_side))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }
}

/// The first connection (control) succeeds, every pickup fails
pub struct FailingPickupConnector {
    inner: Arc<MemoryConnector>,
    attempts: AtomicUsize,
}

impl FailingPickupConnector {
    pub fn new(server: Arc<TunnelServer>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryConnector::new(server),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TransportClient for FailingPickupConnector {
    async fn connect(&self) -> anyhow::Result<Conn> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.connect().await
        } else {
            anyhow::bail!("boom")
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }
}

/// The first connection (control) succeeds, every pickup hangs forever
pub struct StallingPickupConnector {
    inner: Arc<MemoryConnector>,
    attempts: AtomicUsize,
}

impl StallingPickupConnector {
    pub fn new(server: Arc<TunnelServer>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryConnector::new(server),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TransportClient for StallingPickupConnector {
    async fn connect(&self) -> anyhow::Result<Conn> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.connect().await
        } else {
            std::future::pending().await
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use faros_tunnel::tls;
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}", counter, std::process::id());

    let cert_path = temp_dir.join(format!("faros-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("faros-test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Client CA plus one client certificate it issued
pub struct ClientPki {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl ClientPki {
    pub fn remove(self) {
        let _ = std::fs::remove_file(self.ca_cert);
        let _ = std::fs::remove_file(self.client_cert);
        let _ = std::fs::remove_file(self.client_key);
    }
}

/// Generate a throwaway client CA and an agent certificate signed by it
pub fn generate_client_pki() -> ClientPki {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
        KeyPair, KeyUsagePurpose,
    };
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let unique_id = format!(
        "{}-{}",
        COUNTER.fetch_add(1, Ordering::SeqCst),
        std::process::id()
    );
    let temp_dir = std::env::temp_dir();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "faros agents test ca");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = Issuer::from_params(&ca_params, &ca_key);

    let client_key = KeyPair::generate().unwrap();
    let mut client_params = CertificateParams::new(vec!["agent-7".to_string()]).unwrap();
    client_params
        .distinguished_name
        .push(DnType::CommonName, "agent-7");
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let client_cert = client_params.signed_by(&client_key, &issuer).unwrap();

    let pki = ClientPki {
        ca_cert: temp_dir.join(format!("faros-test-client-ca-{}.pem", unique_id)),
        client_cert: temp_dir.join(format!("faros-test-client-cert-{}.pem", unique_id)),
        client_key: temp_dir.join(format!("faros-test-client-key-{}.pem", unique_id)),
    };
    std::fs::write(&pki.ca_cert, ca_cert.pem()).unwrap();
    std::fs::write(&pki.client_cert, client_cert.pem()).unwrap();
    std::fs::write(&pki.client_key, client_key.serialize_pem()).unwrap();
    pki
}

/// Poll until the condition holds or the timeout elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A request observed by the downstream test server
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub host: Option<String>,
}

pub type SeenRequests = Arc<Mutex<Vec<SeenRequest>>>;

fn record(seen: &SeenRequests, req: &Request<Incoming>) {
    let header = |name: http::header::HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    seen.lock().push(SeenRequest {
        path: req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_default(),
        authorization: header(http::header::AUTHORIZATION),
        host: header(http::header::HOST),
    });
}

/// Serve HTTP/1 on a single stream, answering every request with 200
pub async fn serve_ok<T>(io: T, seen: SeenRequests)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        record(&seen, &req);
        async move {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                b"ok from downstream",
            ))))
        }
    });
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await;
}

/// Start a downstream HTTP server on an ephemeral local port
pub async fn start_downstream() -> (SocketAddr, SeenRequests) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind downstream server");
    let addr = listener.local_addr().unwrap();
    let seen: SeenRequests = Arc::default();

    let recorder = seen.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_ok(stream, recorder.clone()));
        }
    });

    (addr, seen)
}

/// Start a downstream that accepts `Upgrade: echo` and echoes the upgraded stream
pub async fn start_echo_upgrade_downstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind downstream server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let service = service_fn(|mut req: Request<Incoming>| async move {
                let on_upgrade = hyper::upgrade::on(&mut req);
                tokio::spawn(async move {
                    if let Ok(upgraded) = on_upgrade.await {
                        let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
                        let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    }
                });
                let response = Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(http::header::CONNECTION, "upgrade")
                    .header(http::header::UPGRADE, "echo")
                    .body(Empty::<Bytes>::new())
                    .unwrap();
                Ok::<_, Infallible>(response)
            });
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// Send an `Upgrade: echo` request into the hub and return the upgraded stream
pub async fn upgrade_via_hub(
    server: &Arc<TunnelServer>,
    path: &str,
) -> (StatusCode, Option<TokioIo<hyper::upgrade::Upgraded>>) {
    let (client_side, hub_side) = tokio::io::duplex(64 * 1024);
    let hub = server.clone();
    tokio::spawn(async move {
        let _ = hub.handle_connection(Box::pin(hub_side)).await;
    });

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(client_side))
        .await
        .unwrap();
    tokio::spawn(connection.with_upgrades());

    let request = Request::get(path)
        .header(http::header::HOST, "hub.example.com")
        .header(http::header::CONNECTION, "upgrade")
        .header(http::header::UPGRADE, "echo")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return (status, None);
    }
    let upgraded = hyper::upgrade::on(response).await.unwrap();
    (status, Some(TokioIo::new(upgraded)))
}

/// Send one HTTP request into the hub over an in-memory connection
pub async fn get_via_hub(
    server: &Arc<TunnelServer>,
    path: &str,
    authorization: Option<&str>,
) -> (StatusCode, String) {
    let (client_side, hub_side) = tokio::io::duplex(64 * 1024);
    let hub = server.clone();
    tokio::spawn(async move {
        let _ = hub.handle_connection(Box::pin(hub_side)).await;
    });

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(client_side))
        .await
        .unwrap();
    tokio::spawn(connection);

    let mut request = Request::get(path).header(http::header::HOST, "hub.example.com");
    if let Some(token) = authorization {
        request = request.header(http::header::AUTHORIZATION, token);
    }
    let response = sender
        .send_request(request.body(Empty::<Bytes>::new()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}
