mod backoff;
mod forwarder;

pub use backoff::{Backoff, RECONNECT_DELAY_SECS, RECONNECT_MAX_DELAY_SECS, STEADY_STATE_AFTER};
pub use forwarder::DownstreamForwarder;

use crate::config::ClientConfig;
use crate::listener::Listener;
use crate::transport::{create_transport_client, TransportClient};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行 agent（带自动重连），直到收到 Ctrl+C
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let connector =
        create_transport_client(&config).context("Failed to create transport client")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping client...");
        }
        signal.cancel();
    });

    run_client_until(config, connector, shutdown).await
}

/// 运行 agent 直到 shutdown 被取消
///
/// 每次会话结束后按指数退避重连；持续超过一分钟的会话会重置退避。
pub async fn run_client_until(
    config: ClientConfig,
    connector: Arc<dyn TransportClient>,
    shutdown: CancellationToken,
) -> Result<()> {
    let forwarder = Arc::new(DownstreamForwarder::new(&config.downstream_url)?);
    let mut backoff = Backoff::from_env();

    loop {
        info!(
            "Connecting to {} as {} ({} transport)",
            config.upstream_url,
            config.peer_key(),
            connector.transport_type()
        );

        let started = Instant::now();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = run_session(&config, connector.clone(), forwarder.clone()) => {
                match result {
                    Ok(()) => info!("Tunnel session ended"),
                    Err(e) => error!("Tunnel session error: {:#}", e),
                }
            }
        }

        backoff.session_ended(started.elapsed());
        let delay = backoff.next_delay();
        warn!("Connection lost, reconnecting in {:?}...", delay);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Client stopped");
    Ok(())
}

/// 单次会话：建立控制通道，为每条 pickup 连接提供 HTTP 服务
async fn run_session(
    config: &ClientConfig,
    connector: Arc<dyn TransportClient>,
    forwarder: Arc<DownstreamForwarder>,
) -> Result<()> {
    let listener = Listener::connect(connector, config.peer_key(), &config.tunnel)
        .await
        .context("Failed to establish control channel")?;

    info!("Tunnel established for {}", listener.peer());

    loop {
        match listener.accept().await {
            Ok(conn) => {
                debug!("Serving picked-up connection");
                tokio::spawn(Arc::clone(&forwarder).serve(conn));
            }
            Err(e) if e.is_closed() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
