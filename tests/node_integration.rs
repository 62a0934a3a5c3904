//! Integration tests for gossip nodes
//!
//! Tests real TCP rounds between nodes on loopback using ephemeral ports.

use futures::future::join_all;
use gossip_cache::{Entry, GossipNode, NodeConfig, RoundOutcome, StrategyKind, Value};
use std::net::SocketAddr;
use std::time::Duration;

fn config(name: &str, strategy: StrategyKind) -> NodeConfig {
    NodeConfig::new(name)
        .listen_ip("127.0.0.1".parse().unwrap())
        .listen_port(0)
        .strategy(strategy)
        .sync_period(Duration::from_secs(3600))
        .io_timeout(Duration::from_secs(2))
}

async fn started(config: NodeConfig) -> (GossipNode, SocketAddr) {
    let node = GossipNode::new(config).unwrap();
    let addr = node.start().await.unwrap();
    (node, addr)
}

/// Poll `check` until it holds or `timeout` elapses.
async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn version_of(node: &GossipNode, key: &str) -> Option<i64> {
    node.cache().get(key).map(|e| e.version)
}

fn sorted(node: &GossipNode) -> Vec<Entry> {
    let mut entries = node.snapshot();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

async fn assert_round_reconciles(strategy: StrategyKind) {
    let (a, _) = started(config("a", strategy)).await;
    let (b, b_addr) = started(config("b", strategy)).await;

    a.store(vec![Entry::new("only-a", 1, "from a"), Entry::new("shared", 1, "old")]);
    b.store(vec![Entry::new("only-b", 2, "from b"), Entry::new("shared", 3, "new")]);

    let outcome = a.sync_with(&b_addr.to_string()).await.unwrap();
    assert_eq!(outcome, RoundOutcome::Started);

    let converged = wait_until(Duration::from_secs(3), || {
        a.cache().len() == 3 && b.cache().len() == 3 && sorted(&a) == sorted(&b)
    })
    .await;
    assert!(converged, "a={:?} b={:?}", sorted(&a), sorted(&b));

    let shared = a.cache().get("shared").unwrap();
    assert_eq!(shared.version, 3);
    assert_eq!(shared.value, Value::Text("new".to_string()));
    assert_eq!(version_of(&b, "only-a"), Some(1));
    assert_eq!(version_of(&a, "only-b"), Some(2));

    a.stop();
    b.stop();
}

/// One push-pull round converges both sides in both directions
#[tokio::test]
async fn test_push_pull_round_reconciles_both_sides() {
    assert_round_reconciles(StrategyKind::PushPull).await;
}

/// One digest round converges both sides in both directions
#[tokio::test]
async fn test_digest_round_reconciles_both_sides() {
    assert_round_reconciles(StrategyKind::Digest).await;
}

/// A delete travels as a versioned tombstone
#[tokio::test]
async fn test_tombstone_propagates() {
    for strategy in [StrategyKind::PushPull, StrategyKind::Digest] {
        let (a, _) = started(config("a", strategy)).await;
        let (b, b_addr) = started(config("b", strategy)).await;

        b.store(vec![Entry::new("session", 1, "live")]);
        a.store(vec![Entry::tombstone("session", 2)]);

        a.sync_with(&b_addr.to_string()).await.unwrap();

        let deleted = wait_until(Duration::from_secs(3), || {
            b.cache().get("session").map(|e| e.tombstone && e.version == 2).unwrap_or(false)
        })
        .await;
        assert!(deleted, "strategy {:?}", strategy);

        a.stop();
        b.stop();
    }
}

/// Equal versions keep whatever each side already had
#[tokio::test]
async fn test_equal_versions_keep_local_value() {
    for strategy in [StrategyKind::PushPull, StrategyKind::Digest] {
        let (a, _) = started(config("a", strategy)).await;
        let (b, b_addr) = started(config("b", strategy)).await;

        a.store(vec![Entry::new("tie", 5, "a-value"), Entry::new("marker", 1, "m")]);
        b.store(vec![Entry::new("tie", 5, "b-value")]);

        a.sync_with(&b_addr.to_string()).await.unwrap();
        assert!(wait_until(Duration::from_secs(3), || b.cache().get("marker").is_some()).await);

        assert_eq!(a.cache().get("tie").unwrap().value, Value::Text("a-value".to_string()));
        assert_eq!(b.cache().get("tie").unwrap().value, Value::Text("b-value".to_string()));

        a.stop();
        b.stop();
    }
}

/// Repeated rounds to the same peer reuse one pooled connection
#[tokio::test]
async fn test_rounds_reuse_pooled_connection() {
    let (a, _) = started(config("a", StrategyKind::Digest)).await;
    let (b, b_addr) = started(config("b", StrategyKind::Digest)).await;

    a.store(vec![Entry::new("k", 1, "v1")]);
    a.sync_with(&b_addr.to_string()).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || version_of(&b, "k") == Some(1)).await);

    a.store(vec![Entry::new("k", 2, "v2")]);
    let outcome = a.sync_with(&b_addr.to_string()).await.unwrap();
    assert!(matches!(outcome, RoundOutcome::Started | RoundOutcome::Busy));
    if outcome == RoundOutcome::Busy {
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.sync_with(&b_addr.to_string()).await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(3), || version_of(&b, "k") == Some(2)).await);

    assert_eq!(a.connection_count(), 1);
    assert_eq!(b.connection_count(), 1);

    a.stop();
    b.stop();
}

/// The scheduler alone converges a chain of three nodes
#[tokio::test]
async fn test_scheduler_converges_three_nodes() {
    for strategy in [StrategyKind::PushPull, StrategyKind::Digest] {
        let period = Duration::from_millis(50);

        let (c, c_addr) = started(config("c", strategy).sync_period(period)).await;
        let (b, b_addr) = started(
            config("b", strategy)
                .sync_period(period)
                .peers(vec![c_addr.to_string()]),
        )
        .await;
        let (a, _) = started(
            config("a", strategy)
                .sync_period(period)
                .peers(vec![b_addr.to_string()]),
        )
        .await;

        a.store(vec![Entry::new("1", 1, "1")]);
        c.store(vec![Entry::new("2", 1, "2"), Entry::new("1", 2, "1.2")]);

        let converged = wait_until(Duration::from_secs(5), || {
            [&a, &b, &c].iter().all(|n| {
                n.cache().len() == 2
                    && version_of(n, "1") == Some(2)
                    && version_of(n, "2") == Some(1)
            })
        })
        .await;
        assert!(
            converged,
            "strategy {:?}: a={:?} b={:?} c={:?}",
            strategy,
            sorted(&a),
            sorted(&b),
            sorted(&c)
        );

        for node in [&a, &b, &c] {
            node.stop();
        }
    }
}

/// Local writes racing with many rounds never lose a newer version
#[tokio::test]
async fn test_concurrent_rounds_and_writes() {
    let (a, _) = started(config("a", StrategyKind::PushPull)).await;
    let (b, b_addr) = started(config("b", StrategyKind::PushPull)).await;
    let target = b_addr.to_string();

    let rounds = (0..20).map(|i| {
        a.store(vec![Entry::new(format!("k{}", i % 5), i as i64, i as i64)]);
        a.sync_with(&target)
    });
    let results = join_all(rounds).await;
    assert!(results.iter().all(|r| r.is_ok()));

    a.sync_with(&target).await.unwrap();
    let converged = wait_until(Duration::from_secs(3), || {
        (0..5).all(|k| {
            let key = format!("k{}", k);
            let expected = (0..20).filter(|i| i % 5 == k).max().map(|i| i as i64);
            version_of(&b, &key) == expected && version_of(&a, &key) == expected
        })
    })
    .await;
    assert!(converged, "a={:?} b={:?}", sorted(&a), sorted(&b));

    a.stop();
    b.stop();
}

/// A peer speaking the other strategy's wire format is dropped, not trusted
#[tokio::test]
async fn test_mismatched_strategies_drop_connection() {
    let (a, _) = started(config("a", StrategyKind::PushPull)).await;
    let (b, b_addr) = started(config("b", StrategyKind::Digest)).await;

    a.store(vec![Entry::new("k", 1, "v")]);
    a.sync_with(&b_addr.to_string()).await.unwrap();

    let dropped = wait_until(Duration::from_secs(3), || {
        b.connection_count() == 0 && a.connection_count() == 0
    })
    .await;
    assert!(dropped);
    assert!(b.cache().is_empty());

    a.stop();
    b.stop();
}

/// Stopping a node ends join, refuses new rounds and closes the listener
#[tokio::test]
async fn test_shutdown_stops_node() {
    let (a, _) = started(config("a", StrategyKind::Digest)).await;
    let (b, b_addr) = started(config("b", StrategyKind::Digest)).await;

    a.store(vec![Entry::new("k", 1, "v")]);
    a.sync_with(&b_addr.to_string()).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || version_of(&b, "k") == Some(1)).await);

    assert!(b.shutdown(Duration::from_secs(3)).await);
    let joined = tokio::time::timeout(Duration::from_secs(3), b.join()).await;
    assert!(matches!(joined, Ok(Ok(()))));
    assert_eq!(b.sync_with("127.0.0.1:1").await.unwrap(), RoundOutcome::ShuttingDown);

    let closed = {
        let mut closed = false;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(b_addr).await.is_err() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        closed
    };
    assert!(closed);

    // State survives shutdown for inspection
    assert_eq!(version_of(&b, "k"), Some(1));

    a.stop();
}
