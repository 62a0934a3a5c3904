//! gossip-cache Library
//!
//! This module exposes the gossip cache components for use in integration
//! tests and as a library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use config::load_config;
pub use replication::{
    Digest, Entry, GossipNode, NodeConfig, RoundOutcome, StrategyKind, Value, VersionedCache,
};
