//! Versioned Cache
//!
//! In-memory key/value table with Last-Write-Wins conflict resolution keyed on
//! entry version. Every multi-entry operation runs under a single table-wide
//! lock so concurrent callers observe whole reads and whole writes.

use crate::replication::types::{Digest, Entry};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Result of comparing a peer's digests against local state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DigestDiff {
    /// Local entries strictly newer than advertised, or absent from the peer
    pub newer: Vec<Entry>,
    /// Peer digests that are strictly newer than local state, or unknown locally
    pub wanted: Vec<Digest>,
}

/// Versioned cache shared by the local API and every connection task.
#[derive(Debug, Default)]
pub struct VersionedCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl VersionedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Get the entry currently held for `key`, tombstones included.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.entries.read().get(key).cloned()
    }

    /// Snapshot of every entry. No ordering across keys.
    pub fn get_all(&self) -> Vec<Entry> {
        self.entries.read().values().cloned().collect()
    }

    /// Snapshot of every entry's digest.
    pub fn digests(&self) -> Vec<Digest> {
        self.entries.read().values().map(Entry::digest).collect()
    }

    /// Install newer incoming entries and report what the sender is missing.
    ///
    /// The returned set holds every local entry strictly newer than the
    /// sender's copy (tombstones included, so deletes reach live peers), plus
    /// every live local entry whose key the sender did not mention at all.
    pub fn apply(&self, incoming: Vec<Entry>) -> Vec<Entry> {
        let mut guard = self.entries.write();
        let mut missing = Vec::new();
        let mut mentioned = HashSet::with_capacity(incoming.len());
        let mut reported = HashSet::new();

        for entry in incoming {
            mentioned.insert(entry.key.clone());
            match guard.get(&entry.key) {
                Some(local) if local.supersedes(&entry) => {
                    if reported.insert(local.key.clone()) {
                        missing.push(local.clone());
                    }
                }
                Some(local) if !entry.supersedes(local) => {}
                _ => {
                    guard.insert(entry.key.clone(), entry);
                }
            }
        }

        for (key, local) in guard.iter() {
            if !local.tombstone && !mentioned.contains(key) {
                missing.push(local.clone());
            }
        }

        missing
    }

    /// Compare a peer's digests against local state without mutating it.
    pub fn apply_digest(&self, digests: &[Digest]) -> DigestDiff {
        let guard = self.entries.read();
        let mut diff = DigestDiff::default();
        let mut mentioned = HashSet::with_capacity(digests.len());

        for digest in digests {
            mentioned.insert(digest.key.as_str());
            match guard.get(&digest.key) {
                Some(local) if local.version > digest.version => {
                    diff.newer.push(local.clone());
                }
                Some(local) if local.version == digest.version => {}
                _ => diff.wanted.push(digest.clone()),
            }
        }

        for (key, local) in guard.iter() {
            if !local.tombstone && !mentioned.contains(key.as_str()) {
                diff.newer.push(local.clone());
            }
        }

        diff
    }

    /// Resolve requested digests to the entries currently held for their keys.
    ///
    /// Unknown keys are skipped.
    pub fn fetch(&self, digests: &[Digest]) -> Vec<Entry> {
        let guard = self.entries.read();
        digests
            .iter()
            .filter_map(|digest| guard.get(&digest.key).cloned())
            .collect()
    }

    /// Local-origin write path. Same version rule as [`apply`](Self::apply).
    ///
    /// Returns the number of entries installed.
    pub fn store(&self, entries: Vec<Entry>) -> usize {
        let mut guard = self.entries.write();
        let mut installed = 0;

        for entry in entries {
            let wins = guard
                .get(&entry.key)
                .map_or(true, |local| entry.supersedes(local));
            if wins {
                guard.insert(entry.key.clone(), entry);
                installed += 1;
            }
        }

        installed
    }
}
