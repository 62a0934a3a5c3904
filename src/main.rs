//! gossip-cache - Anti-entropy replicated key/value cache
//!
//! Composition root: reads `GOSSIP_*` configuration, seeds local entries,
//! runs one node until Ctrl+C or SIGTERM, then drains.

use gossip_cache::config::load_config;
use gossip_cache::infrastructure::shutdown_signal;
use gossip_cache::GossipNode;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let node_config = cfg.node_config()?;
    let drain_timeout = node_config.io_timeout;
    let node = GossipNode::new(node_config)?;

    let seeded = node.store(cfg.seed_entries());
    if seeded > 0 {
        tracing::info!("seeded {} local entries", seeded);
    }

    let addr = node.start().await?;
    tracing::info!(
        "starting gossip-cache node={} listen={} peers={:?}",
        node.name(),
        addr,
        node.config().peers
    );

    tokio::spawn(shutdown_signal(node.shutdown_controller()));

    let result = node.join().await;

    if !node.shutdown(drain_timeout).await {
        tracing::warn!("exiting with connections still open");
    }

    let mut snapshot = node.snapshot();
    snapshot.sort_by(|a, b| a.key.cmp(&b.key));
    tracing::info!("final snapshot: {} entries", snapshot.len());
    for entry in &snapshot {
        tracing::info!(
            "  {} v{} {:?}{}",
            entry.key,
            entry.version,
            entry.value,
            if entry.tombstone { " (deleted)" } else { "" }
        );
    }

    result
}
