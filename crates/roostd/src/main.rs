//! Roost console runner
//!
//! Usage:
//!   # Run the node list from config/config.yaml
//!   roostd
//!
//!   # Custom configuration and verbose logging
//!   roostd --config my-nodes.yaml --log-level debug
//!
//!   # Watch a leader failover and rejoin
//!   roostd --failover-demo

mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use cli::Cli;
use roost_cluster::{Cluster, ClusterConfig, Gossip, MemoryHub};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Console configuration: the full node list run by this process
#[derive(Debug, Deserialize)]
struct ConsoleConfig {
    nodes: Vec<ClusterConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let console: ConsoleConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", cli.config.display()))?;

    if console.nodes.is_empty() {
        bail!("configuration contains no nodes");
    }
    let mut seen = HashSet::new();
    for node in &console.nodes {
        if !seen.insert(node.node_id) {
            bail!("duplicate node_id {} in configuration", node.node_id);
        }
    }

    let hub = MemoryHub::new();
    let mut clusters = Vec::with_capacity(console.nodes.len());
    for cfg in console.nodes.iter().cloned() {
        let node_id = cfg.node_id;
        let cluster = create_node(&hub, cfg)
            .await
            .with_context(|| format!("starting node {node_id}"))?;
        info!(node_id, "node started");
        clusters.push(cluster);
    }

    if cli.failover_demo {
        run_failover_demo(&hub, &mut clusters, &console).await?;
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    let mut failed = false;
    for cluster in clusters {
        let node_id = cluster.node_id();
        if let Err(e) = cluster.shutdown().await {
            error!(node_id, error = %e, "node shutdown failed");
            failed = true;
        }
    }
    if failed {
        bail!("one or more nodes failed to shut down cleanly");
    }

    info!("all nodes stopped");
    Ok(())
}

async fn create_node(hub: &MemoryHub, cfg: ClusterConfig) -> roost_cluster::Result<Cluster> {
    Cluster::create(cfg, |opts, hooks| {
        hub.create(opts, hooks).map(|g| g as Arc<dyn Gossip>)
    })
    .await
}

/// Replay of the classic failover script: let the cluster settle, stop the
/// first node, let the survivors re-elect and re-assign, then bring the
/// first node back as an ordinary joiner.
async fn run_failover_demo(
    hub: &MemoryHub,
    clusters: &mut Vec<Cluster>,
    console: &ConsoleConfig,
) -> anyhow::Result<()> {
    tokio::time::sleep(Duration::from_secs(16)).await;
    log_status(clusters);

    info!("failover demo: stopping the first node");
    let first = clusters.remove(0);
    first.shutdown().await.context("stopping the first node")?;

    tokio::time::sleep(Duration::from_secs(32)).await;
    log_status(clusters);

    info!("failover demo: restarting the first node");
    let mut cfg = console.nodes[0].clone();
    cfg.first = false;
    cfg.join_nodes = console
        .nodes
        .iter()
        .skip(1)
        .map(|n| n.advertised_endpoint())
        .collect();

    let node_id = cfg.node_id;
    let cluster = create_node(hub, cfg)
        .await
        .with_context(|| format!("restarting node {node_id}"))?;
    clusters.insert(0, cluster);

    tokio::time::sleep(Duration::from_secs(16)).await;
    log_status(clusters);
    Ok(())
}

fn log_status(clusters: &[Cluster]) {
    for cluster in clusters {
        let snap = cluster.snapshot();
        let local = &snap.nodes[&cluster.node_id()];
        info!(
            node_id = cluster.node_id(),
            phase = %local.state,
            leader = local.leader,
            workers = ?local.workers,
            members = snap.indexes.len(),
            "status"
        );
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
