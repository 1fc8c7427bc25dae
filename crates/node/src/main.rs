//! ringstore-node: entry point for a ringstore node.
//!
//! Loads config, opens the local store, joins an in-process ring and
//! handles topology events until Ctrl+C.

use ringstore_replication::{node_id, open_node, InProcessPeers, ObjectStoreService};
use ringstore_ring::Membership;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ringstore_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = ringstore_config::load_from_file(std::path::Path::new(&config_path))?;

    let id = node_id(&config)?;
    let membership = Membership::new();
    let peers = InProcessPeers::new();
    let node = open_node(&config, Arc::new(membership.view(id)), peers.clone())?;

    let service: Arc<dyn ObjectStoreService> = node.clone();
    peers.register(&service);
    let events = membership.subscribe(id);
    let listener = node.spawn_event_listener(events);
    membership.join(id);
    tracing::info!(
        "node {} serving {} keys from {:?}",
        id,
        node.key_set().len(),
        config.storage.data_dir
    );

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = ringstore_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");
    membership.fail(id);
    listener.abort();
    Ok(())
}
