//! Sync Scheduler
//!
//! Every `sync_period` picks one configured peer uniformly at random and
//! opens a reconciliation round with it.

use crate::replication::connection::{self, RoundOutcome};
use crate::replication::node::NodeContext;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Periodic peer selection for outbound rounds.
pub struct SyncScheduler {
    peers: Vec<String>,
    period: Duration,
    rng: StdRng,
}

impl SyncScheduler {
    pub fn new(peers: Vec<String>, period: Duration) -> Self {
        Self {
            peers,
            period,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic peer selection, for tests.
    pub fn with_seed(peers: Vec<String>, period: Duration, seed: u64) -> Self {
        Self {
            peers,
            period,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Pick the next round's peer. `None` when no peers are configured.
    pub fn pick_peer(&mut self) -> Option<&str> {
        self.peers.choose(&mut self.rng).map(String::as_str)
    }

    /// Tick until shutdown. Each round runs in its own task so a slow dial
    /// never delays the next tick.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub(crate) async fn run(mut self, ctx: Arc<NodeContext>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "[{}] sync scheduler started: {} peers every {:?}",
            ctx.config.name,
            self.peers.len(),
            self.period
        );

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(peer) = self.pick_peer().map(str::to_string) else {
                tracing::trace!("[{}] no peers configured, skipping tick", ctx.config.name);
                continue;
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                match connection::initiate_round(&ctx, &peer).await {
                    Ok(RoundOutcome::Started) | Ok(RoundOutcome::ShuttingDown) => {}
                    Ok(RoundOutcome::Busy) => {
                        tracing::debug!(
                            "[{}] round with {} still in flight, skipped",
                            ctx.config.name,
                            peer
                        );
                    }
                    Err(e) => {
                        tracing::warn!("[{}] sync round failed: {:#}", ctx.config.name, e);
                    }
                }
            });
        }

        tracing::info!("[{}] sync scheduler stopped", ctx.config.name);
    }
}
