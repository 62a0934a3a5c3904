use crate::replication::{ConfigError, Entry, NodeConfig, StrategyKind};
use anyhow::Context;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Process configuration read from `GOSSIP_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Node identity and listener
    pub node_name: String,
    pub listen_ip: String,
    pub listen_port: u16,

    // Peers and reconciliation
    pub peers: Vec<String>,
    pub sync_period_ms: u64,
    pub strategy: String,

    // Deadlines and limits
    pub io_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_frame_len: usize,

    /// Entries stored locally before the node starts (`key=value` or `key@version=value`)
    pub seed: Vec<SeedEntry>,
    pub debug: bool,
}

/// One entry from `GOSSIP_SEED`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SeedEntry {
    pub key: String,
    pub version: i64,
    pub value: String,
}

impl SeedEntry {
    pub fn to_entry(&self) -> Entry {
        Entry::new(self.key.clone(), self.version, self.value.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "gossip".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 5100,
            peers: Vec::new(),
            sync_period_ms: 5_000,
            strategy: "digest".to_string(),
            io_timeout_ms: 10_000,
            idle_timeout_ms: 300_000,
            max_frame_len: 16 * 1024 * 1024,
            seed: Vec::new(),
            debug: false,
        }
    }
}

impl Config {
    /// Build a config from an arbitrary variable lookup. Unset variables and
    /// unparseable numbers keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let node_name = lookup("GOSSIP_NODE_NAME").unwrap_or(defaults.node_name);
        let listen_ip = lookup("GOSSIP_LISTEN_IP").unwrap_or(defaults.listen_ip);

        let listen_port = lookup("GOSSIP_LISTEN_PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.listen_port);

        let peers = lookup("GOSSIP_PEERS")
            .map(|v| split_list(&v).map(str::to_string).collect())
            .unwrap_or_default();

        let sync_period_ms = lookup("GOSSIP_SYNC_PERIOD_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.sync_period_ms);

        let strategy = lookup("GOSSIP_STRATEGY").unwrap_or(defaults.strategy);

        let io_timeout_ms = lookup("GOSSIP_IO_TIMEOUT_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.io_timeout_ms);

        let idle_timeout_ms = lookup("GOSSIP_IDLE_TIMEOUT_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.idle_timeout_ms);

        let max_frame_len = lookup("GOSSIP_MAX_FRAME_LEN")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.max_frame_len);

        let seed = lookup("GOSSIP_SEED")
            .map(|v| parse_seed(&v))
            .unwrap_or_default();

        let debug = lookup("DEBUG").is_some();

        Config {
            node_name,
            listen_ip,
            listen_port,
            peers,
            sync_period_ms,
            strategy,
            io_timeout_ms,
            idle_timeout_ms,
            max_frame_len,
            seed,
            debug,
        }
    }

    /// Convert to the node's static configuration.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let listen_ip: IpAddr = self
            .listen_ip
            .trim()
            .parse()
            .with_context(|| format!("invalid GOSSIP_LISTEN_IP {:?}", self.listen_ip))?;
        let strategy: StrategyKind = self.strategy.parse().map_err(ConfigError::UnknownStrategy)?;

        let config = NodeConfig::new(self.node_name.clone())
            .listen_ip(listen_ip)
            .listen_port(self.listen_port)
            .peers(self.peers.clone())
            .sync_period(Duration::from_millis(self.sync_period_ms))
            .strategy(strategy)
            .io_timeout(Duration::from_millis(self.io_timeout_ms))
            .idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .max_frame_len(self.max_frame_len);
        config.validate()?;
        Ok(config)
    }

    pub fn seed_entries(&self) -> Vec<Entry> {
        self.seed.iter().map(SeedEntry::to_entry).collect()
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    Ok(Config::from_lookup(|key| std::env::var(key).ok()))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse `key=value,key@3=value`. Malformed items are skipped.
fn parse_seed(raw: &str) -> Vec<SeedEntry> {
    split_list(raw)
        .filter_map(|item| {
            let Some((head, value)) = item.split_once('=') else {
                tracing::warn!("ignoring seed entry without '=': {:?}", item);
                return None;
            };
            let (key, version) = match head.split_once('@') {
                Some((key, version)) => match version.trim().parse() {
                    Ok(version) => (key, version),
                    Err(_) => {
                        tracing::warn!("ignoring seed entry with bad version: {:?}", item);
                        return None;
                    }
                },
                None => (head, 1),
            };
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(SeedEntry {
                key: key.to_string(),
                version,
                value: value.trim().to_string(),
            })
        })
        .collect()
}
