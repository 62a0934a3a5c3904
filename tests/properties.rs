//! Property tests for the versioned cache, both strategies and the framer.

use gossip_cache::replication::transport::{decode_frame, encode_frame};
use gossip_cache::replication::{
    DigestExchange, Message, PushPull, ReconciliationStrategy, WireFormat,
};
use gossip_cache::{Entry, Value, VersionedCache};
use proptest::prelude::*;
use std::collections::HashMap;

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Float),
        "[a-z]{0,6}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
    ]
}

fn entry(with_tombstones: bool) -> impl Strategy<Value = Entry> {
    let tombstone = if with_tombstones { any::<bool>().boxed() } else { Just(false).boxed() };
    ("k[0-5]", 0i64..20, value(), tombstone).prop_map(|(key, version, value, tombstone)| Entry {
        key,
        version,
        value,
        tombstone,
    })
}

fn entries(with_tombstones: bool) -> impl Strategy<Value = Vec<Entry>> {
    prop::collection::vec(entry(with_tombstones), 0..24)
}

fn versions(cache: &VersionedCache) -> HashMap<String, i64> {
    cache.get_all().into_iter().map(|e| (e.key, e.version)).collect()
}

fn max_versions<'a>(batches: impl IntoIterator<Item = &'a Vec<Entry>>) -> HashMap<String, i64> {
    let mut max = HashMap::new();
    for entry in batches.into_iter().flatten() {
        let slot = max.entry(entry.key.clone()).or_insert(entry.version);
        *slot = (*slot).max(entry.version);
    }
    max
}

fn cache_with(entries: &[Entry]) -> VersionedCache {
    let cache = VersionedCache::new();
    cache.store(entries.to_vec());
    cache
}

/// Drive one round between two in-memory caches.
fn run_round(
    strategy: &dyn ReconciliationStrategy,
    initiator: &VersionedCache,
    receiver: &VersionedCache,
) {
    let mut next = Some((strategy.open_round(initiator), true));
    while let Some((message, to_receiver)) = next.take() {
        let target = if to_receiver { receiver } else { initiator };
        next = strategy
            .on_message(message, target)
            .expect("strategy accepts its own messages")
            .map(|reply| (reply, !to_receiver));
    }
}

proptest! {
    #[test]
    fn stored_version_never_decreases(batches in prop::collection::vec(entries(true), 1..6)) {
        let cache = VersionedCache::new();
        let mut seen: HashMap<String, i64> = HashMap::new();

        for batch in &batches {
            cache.store(batch.clone());
            for (key, version) in versions(&cache) {
                if let Some(previous) = seen.get(&key) {
                    prop_assert!(version >= *previous);
                }
                seen.insert(key, version);
            }
        }

        prop_assert_eq!(versions(&cache), max_versions(&batches));
    }

    #[test]
    fn applying_twice_changes_nothing(local in entries(true), incoming in entries(true)) {
        let cache = cache_with(&local);
        cache.apply(incoming.clone());
        let after_first = cache.get_all().len();
        let snapshot = versions(&cache);

        cache.apply(incoming.clone());
        prop_assert_eq!(cache.get_all().len(), after_first);
        prop_assert_eq!(versions(&cache), snapshot);
        prop_assert_eq!(cache.store(incoming), 0);
    }

    #[test]
    fn push_pull_round_converges(a in entries(false), b in entries(false)) {
        let left = cache_with(&a);
        let right = cache_with(&b);

        run_round(&PushPull, &left, &right);

        let expected = max_versions([&a, &b]);
        prop_assert_eq!(versions(&left), expected.clone());
        prop_assert_eq!(versions(&right), expected);
    }

    #[test]
    fn digest_round_converges(a in entries(false), b in entries(false)) {
        let left = cache_with(&a);
        let right = cache_with(&b);

        run_round(&DigestExchange, &left, &right);

        let expected = max_versions([&a, &b]);
        prop_assert_eq!(versions(&left), expected.clone());
        prop_assert_eq!(versions(&right), expected);
    }

    #[test]
    fn initiator_tombstones_reach_receiver(a in entries(true), b in entries(false)) {
        for strategy in [&PushPull as &dyn ReconciliationStrategy, &DigestExchange] {
            let left = cache_with(&a);
            let right = cache_with(&b);

            run_round(strategy, &left, &right);

            for dead in left.get_all().into_iter().filter(|e| e.tombstone) {
                let seen = right.get(&dead.key).expect("receiver holds the key");
                prop_assert!(seen.version >= dead.version);
            }
        }
    }

    #[test]
    fn frames_decode_to_what_was_encoded(push in entries(true), pull in entries(true)) {
        let pull: Vec<_> = pull.iter().map(Entry::digest).collect();
        let messages = [
            (Message::Push(push.clone()), WireFormat::Json),
            (Message::PushReply(push.clone()), WireFormat::Json),
            (Message::Begin(pull.clone()), WireFormat::Binary),
            (Message::Exchange { push: push.clone(), pull }, WireFormat::Binary),
            (Message::End(push), WireFormat::Binary),
        ];

        for (message, format) in messages {
            let frame = encode_frame(&message, format).unwrap();
            let decoded = decode_frame(&frame, format, usize::MAX).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
