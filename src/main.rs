mod collector;
mod config;
mod discover;
mod labels;
mod resolve;
mod server;
mod snapshot;
mod usage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kube::Client;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use crate::collector::Collector;
use crate::config::Config;
use crate::resolve::KubeResolver;
use crate::snapshot::SnapshotSlot;

/// Bound on each Kubernetes API call so one stuck request cannot stall the
/// rest of a collection cycle.
const API_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting local storage exporter on node {}", config.node_name);
    info!("storage classes: {:?}", config.storage_class_names);
    info!(
        "storage roots: {:?}",
        config.roots.iter().map(|r| &r.host_path).collect::<Vec<_>>()
    );
    info!("update interval: {:?}", config.update_interval);

    let client = Client::try_default()
        .await
        .context("could not load Kubernetes client configuration")?;
    let resolver = Arc::new(KubeResolver::new(
        client,
        &config.storage_class_names,
        API_TIMEOUT,
    ));

    let slot = Arc::new(SnapshotSlot::new());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind metrics port {}", config.metrics_port))?;

    tokio::spawn(Collector::new(config, resolver, slot.clone()).run());

    info!("serving metrics on {}", addr);
    axum::serve(listener, server::router(slot).into_make_service()).await?;

    Ok(())
}
