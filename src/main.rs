//! distcache - A distributed in-memory cache node
//!
//! Starts one cache node: local LRU store, ring membership, quorum
//! coordinator, failure detector and the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distcache::api::{create_router, AppState};
use distcache::replication::HttpPeerClient;
use distcache::ring::{MembershipEvent, NodeId};
use distcache::tasks::spawn_ring_logger;
use distcache::{CacheNode, Config};

/// Main entry point for a cache node.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Configure the node (store, ring, coordinator)
/// 4. Start the failure detector and ring logger
/// 5. Announce this node to its peers
/// 6. Serve HTTP until SIGINT/SIGTERM, then announce departure
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber with env filter
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distcache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting distcache node");

    let config = Config::from_env()?;
    let settings = config.cluster_settings()?;
    info!(
        node = %config.node_addr,
        port = config.server_port,
        peers = config.peers.len(),
        max_entries = config.max_entries,
        "Configuration loaded"
    );

    // Peer calls get their own deadline from the coordinator and detector;
    // the client-level timeout only backstops announcements
    let backstop = settings.replica_timeout.max(settings.probe.timeout) * 4;
    let peers = Arc::new(
        HttpPeerClient::new(backstop).context("failed to build the peer HTTP client")?,
    );

    let node = Arc::new(CacheNode::configure(
        settings,
        config.node_id(),
        config.node_weight,
        config.peers.clone(),
        peers.clone(),
    )?);

    let mut background: Vec<JoinHandle<()>> = vec![spawn_ring_logger(node.membership())];
    if let Some(handle) = node.spawn_failure_detector(peers.clone()) {
        background.push(handle);
        info!("Failure detector started");
    }

    let joined = MembershipEvent::Joined {
        node: node.local_id().clone(),
        weight: config.node_weight,
    };
    announce(&peers, &config.peers, &joined).await;

    let app = create_router(AppState::new(node.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(background))
        .await
        .context("server error")?;

    let left = MembershipEvent::Left {
        node: node.local_id().clone(),
    };
    announce(&peers, &config.peers, &left).await;

    info!("Server shutdown complete");
    Ok(())
}

/// Sends `event` to every configured peer. Best effort: failures are logged.
async fn announce(client: &HttpPeerClient, peers: &[(NodeId, u32)], event: &MembershipEvent) {
    let calls = peers.iter().map(|(peer, _)| async move {
        match tokio::time::timeout(Duration::from_secs(2), client.announce(peer, event)).await {
            Ok(Ok(reply)) => info!(%peer, ring_version = reply.ring_version, "Peer notified"),
            Ok(Err(error)) => warn!(%peer, %error, "Could not notify peer"),
            Err(_) => warn!(%peer, "Timed out notifying peer"),
        }
    });
    join_all(calls).await;
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the background tasks and allows graceful shutdown.
async fn shutdown_signal(background: Vec<JoinHandle<()>>) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    for handle in background {
        handle.abort();
    }
    warn!("Background tasks aborted");
}
