//! Node Configuration
//!
//! Static settings fixed at node construction and read-only afterwards.

use crate::infrastructure::connection_pool::PoolConfig;
use crate::replication::protocol::StrategyKind;
use crate::replication::transport::{FrameLimits, TYPE_HEADER_LEN};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for one gossip node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name used in log lines
    pub name: String,

    /// Address to bind the acceptor on (default: 0.0.0.0)
    pub listen_ip: IpAddr,

    /// Port to bind the acceptor on (default: 5100, 0 picks an ephemeral port)
    pub listen_port: u16,

    /// Candidate peers for outbound rounds (host:port)
    pub peers: Vec<String>,

    /// Interval between outbound rounds (default: 5s)
    pub sync_period: Duration,

    /// Reconciliation strategy (default: digest)
    pub strategy: StrategyKind,

    /// Dial, write and partial-frame read deadline (default: 10s)
    pub io_timeout: Duration,

    /// How long an idle connection may wait for its next frame (default: 300s)
    pub idle_timeout: Duration,

    /// Largest accepted frame payload (default: 16 MiB)
    pub max_frame_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "gossip".to_string(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 5100,
            peers: Vec::new(),
            sync_period: Duration::from_secs(5),
            strategy: StrategyKind::default(),
            io_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn sync_period(mut self, period: Duration) -> Self {
        self.sync_period = period;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_frame_len: self.max_frame_len,
            idle_timeout: self.idle_timeout,
            io_timeout: self.io_timeout,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            format: self.strategy.build().wire_format(),
            connect_timeout: self.io_timeout,
            write_timeout: self.io_timeout,
        }
    }

    /// Validate the configuration. An empty peer list is allowed: such a node
    /// only answers inbound rounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_period.is_zero() {
            return Err(ConfigError::ZeroSyncPeriod);
        }
        if self.io_timeout.is_zero() {
            return Err(ConfigError::ZeroIoTimeout);
        }
        if self.idle_timeout < self.io_timeout {
            return Err(ConfigError::IdleTimeoutTooShort);
        }
        if self.max_frame_len < TYPE_HEADER_LEN {
            return Err(ConfigError::FrameLimitTooSmall(self.max_frame_len));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("sync_period must be greater than zero")]
    ZeroSyncPeriod,
    #[error("io_timeout must be greater than zero")]
    ZeroIoTimeout,
    #[error("idle_timeout must not be shorter than io_timeout")]
    IdleTimeoutTooShort,
    #[error("max_frame_len of {0} bytes cannot hold a message header")]
    FrameLimitTooSmall(usize),
    #[error("unknown strategy {0:?} (expected push-pull or digest)")]
    UnknownStrategy(String),
}
