//! Replication Module
//!
//! Eventually-consistent replication of a versioned key/value cache between
//! peers over plain TCP.
//!
//! ## Architecture
//!
//! - **Cache**: Last-Write-Wins table keyed on entry version
//! - **Protocol**: Push-pull (full state) or digest exchange (three messages)
//! - **Transport**: Length-prefixed frames, JSON or bincode payloads
//! - **Node**: Acceptor, sync scheduler and per-connection read loops
//!
//! ## How It Works
//!
//! 1. Every `sync_period` a node picks one configured peer at random
//! 2. It opens a round over a pooled connection, dialing if needed
//! 3. Both sides install whatever the other had that was strictly newer
//! 4. Connections stay pooled and are reused by later rounds in either direction
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gossip_cache::replication::{Entry, GossipNode, NodeConfig, StrategyKind};
//!
//! let config = NodeConfig::new("cache-a")
//!     .peers(vec!["cache-b.internal:5100".to_string()])
//!     .strategy(StrategyKind::Digest);
//!
//! let node = GossipNode::new(config)?;
//! node.store(vec![Entry::new("feature.flag", 3, true)]);
//! node.run().await?;
//! ```

mod acceptor;
mod cache;
mod config;
mod connection;
mod node;
mod protocol;
mod scheduler;
pub mod transport;
mod types;

pub use acceptor::{is_transient, Backoff};
pub use cache::{DigestDiff, VersionedCache};
pub use config::{ConfigError, NodeConfig};
pub use connection::RoundOutcome;
pub use node::GossipNode;
pub use protocol::{
    DigestExchange, ProtocolError, PushPull, ReconciliationStrategy, RoundPhase, StrategyKind,
};
pub use scheduler::SyncScheduler;
pub use transport::{FrameError, FrameLimits, WireFormat};
pub use types::{Digest, Entry, Message, MessageKind, Value};
