//! mw-proxy - Transparent node tunnel proxy
//!
//! Accepts intercepted TCP connections and tunnels each one through the
//! forwarding service to the cluster node that should carry it.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Cli, ProxyConfig};
use mwproxy_auth::{Credentials, KeystoneClient, KeystoneConfig};
use mwproxy_directory::{
    CacheInvalidator, DirectoryConfig, HttpNodeLister, HttpNodeListerConfig, NodeDirectory,
};
use mwproxy_router::ConnectionRouter;
use mwproxy_server::{OriginalDstResolver, ProxyServer, ProxyServerConfig};
use mwproxy_tunnel::{TunnelClient, TunnelConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup logging; an explicit level wins over RUST_LOG
fn setup_logging(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level: {}", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn build_directory(config: &ProxyConfig) -> Result<Arc<NodeDirectory>> {
    let issuer = KeystoneClient::new(
        KeystoneConfig::new(&config.keystone_url).with_timeout(config.request_timeout),
    )
    .context("Failed to create Keystone client")?;

    let lister = HttpNodeLister::new(
        HttpNodeListerConfig::new(&config.qbert_url, &config.project_id)
            .with_timeout(config.request_timeout),
    )
    .context("Failed to create node directory client")?;

    let directory_config = DirectoryConfig::new(Credentials::new(
        &config.username,
        &config.password,
        &config.project_id,
    ))
    .with_cluster_id(&config.cluster_id)
    .with_initial_token(config.token.clone());

    Ok(Arc::new(NodeDirectory::new(
        directory_config,
        Arc::new(issuer),
        Arc::new(lister),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref())?;

    info!(
        "mw-proxy {} ({}, built {}) starting...",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let config = ProxyConfig::from_cli(cli).context("Failed to build proxy configuration")?;

    info!("Node directory: {}", config.qbert_url);
    if config.cluster_id.is_empty() {
        info!("No cluster filter, using every node in the project");
    } else {
        info!("Cluster: {}", config.cluster_id);
    }
    let directory = build_directory(&config)?;
    let invalidator = CacheInvalidator::new(directory.clone(), config.cache_ttl).spawn();

    let tunnel = TunnelClient::new(TunnelConfig::new(config.forwarder_addr.clone()));
    info!("Forwarder: {}", tunnel.forwarder_addr());

    let router = Arc::new(
        ConnectionRouter::new(config.ranges.clone(), directory, tunnel)
            .with_policy(config.resolution_policy),
    );
    info!("Services network: {}", router.ranges().services());
    info!("Containers network: {}", router.ranges().containers());
    info!("On resolution failure: {}", router.policy());

    let server = ProxyServer::new(
        ProxyServerConfig::new(config.listen_addr),
        router,
        Arc::new(OriginalDstResolver::new()),
    );
    let listener = server
        .bind()
        .await
        .context("Failed to start proxy listener")?;

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let server_task = tokio::spawn(server.run(listener));

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("Proxy stopped normally"),
                Ok(Err(e)) => {
                    error!("Proxy error: {}", e);
                    invalidator.abort();
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Proxy task panicked: {}", e);
                    invalidator.abort();
                    return Err(e.into());
                }
            }
        }
    }

    invalidator.abort();
    info!("mw-proxy stopped");
    Ok(())
}
