//! Gossip Node
//!
//! Owns one cache, one connection pool and one strategy, and wires them to the
//! acceptor, the sync scheduler and the per-connection read loops.

use crate::infrastructure::connection_pool::ConnectionPool;
use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::acceptor;
use crate::replication::cache::VersionedCache;
use crate::replication::config::NodeConfig;
use crate::replication::connection::{self, RoundOutcome};
use crate::replication::protocol::ReconciliationStrategy;
use crate::replication::scheduler::SyncScheduler;
use crate::replication::transport::FrameLimits;
use crate::replication::types::Entry;
use anyhow::Context;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// State shared by every task of one node.
pub(crate) struct NodeContext {
    pub(crate) config: NodeConfig,
    pub(crate) cache: VersionedCache,
    pub(crate) strategy: Arc<dyn ReconciliationStrategy>,
    pub(crate) pool: ConnectionPool,
    pub(crate) shutdown: ShutdownController,
    pub(crate) limits: FrameLimits,
}

/// A gossip cache node.
///
/// ```rust,ignore
/// let node = GossipNode::new(NodeConfig::new("n1").peers(vec!["10.0.0.2:5100".into()]))?;
/// node.store(vec![Entry::new("color", 1, "blue")]);
/// node.start().await?;
/// node.join().await?;
/// ```
pub struct GossipNode {
    ctx: Arc<NodeContext>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl GossipNode {
    /// Create a node. Nothing is bound until [`GossipNode::start`].
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let strategy = config.strategy.build();
        let ctx = NodeContext {
            pool: ConnectionPool::new(config.pool_config()),
            limits: config.frame_limits(),
            cache: VersionedCache::new(),
            shutdown: ShutdownController::new(),
            strategy,
            config,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    /// Bind the listener and spawn the acceptor and the sync scheduler.
    /// Returns the bound address.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        if self.ctx.shutdown.is_shutdown() {
            anyhow::bail!("node {} has been stopped", self.name());
        }
        if let Some(addr) = *self.local_addr.lock() {
            anyhow::bail!("node {} already started on {}", self.name(), addr);
        }

        let bind_addr = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        let addr = listener.local_addr()?;

        {
            let mut slot = self.local_addr.lock();
            if let Some(existing) = *slot {
                anyhow::bail!("node {} already started on {}", self.name(), existing);
            }
            *slot = Some(addr);
        }

        tracing::info!(
            "[{}] listening on {} (strategy={}, peers={})",
            self.name(),
            addr,
            self.ctx.strategy.name(),
            self.ctx.config.peers.len()
        );

        let acceptor = tokio::spawn(acceptor::run_acceptor(listener, self.ctx.clone()));
        *self.acceptor.lock() = Some(acceptor);

        let scheduler =
            SyncScheduler::new(self.ctx.config.peers.clone(), self.ctx.config.sync_period);
        *self.scheduler.lock() = Some(tokio::spawn(scheduler.run(self.ctx.clone())));

        Ok(addr)
    }

    /// Start, then wait until the node stops.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self) -> anyhow::Result<()> {
        self.start().await?;
        self.join().await
    }

    /// Wait for the acceptor to finish. Returns the acceptor's error if it
    /// stopped on a persistent accept failure; otherwise waits for the
    /// scheduler too.
    pub async fn join(&self) -> anyhow::Result<()> {
        let acceptor = self.acceptor.lock().take();
        let result = match acceptor {
            Some(handle) => handle.await.context("acceptor task panicked")?,
            None => Ok(()),
        };

        if result.is_ok() {
            let scheduler = self.scheduler.lock().take();
            if let Some(handle) = scheduler {
                handle.await.context("scheduler task panicked")?;
            }
        }
        result
    }

    /// Signal shutdown. Returns immediately.
    pub fn stop(&self) {
        self.ctx.shutdown.shutdown();
    }

    /// Signal shutdown and wait up to `drain` for open connections to finish.
    /// Returns whether every read loop exited in time.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.stop();
        self.ctx.shutdown.wait_for_drain(drain).await
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.lock().is_some() && !self.ctx.shutdown.is_shutdown()
    }

    /// Install entries locally. Returns how many were newer than local state.
    pub fn store(&self, entries: Vec<Entry>) -> usize {
        self.ctx.cache.store(entries)
    }

    /// Every entry, tombstones included.
    pub fn snapshot(&self) -> Vec<Entry> {
        self.ctx.cache.get_all()
    }

    pub fn cache(&self) -> &VersionedCache {
        &self.ctx.cache
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Pooled connections, inbound and outbound.
    pub fn connection_count(&self) -> usize {
        self.ctx.pool.len()
    }

    pub fn shutdown_controller(&self) -> ShutdownController {
        self.ctx.shutdown.clone()
    }

    /// Open one round with `address` right away, outside the schedule.
    pub async fn sync_with(&self, address: &str) -> anyhow::Result<RoundOutcome> {
        connection::initiate_round(&self.ctx, address).await
    }
}

impl Drop for GossipNode {
    fn drop(&mut self) {
        self.ctx.shutdown.shutdown();
    }
}
