//! Multi-group scenarios wired together in-process: single-replica
//! consensus logs, a scripted configuration source and direct peer routing.

use std::sync::Arc;
use std::time::Duration;

use skipta_consensus::{Decision, LocalLog};
use skipta_ctrl::StaticSource;
use skipta_server::{encode_snapshot, LocalRouter, NodeConfig, ServerSnapshot, ShardNode};
use skipta_types::{
    key_to_shard, Command, GroupId, KvOp, OpId, ShardConfig, ShardStatus, SkiptaError,
    SHARD_COUNT,
};

const SETTLE: Duration = Duration::from_secs(5);

fn addr(gid: GroupId) -> String {
    format!("group-{gid}:0")
}

fn node_config(gid: GroupId) -> NodeConfig {
    let mut cfg = NodeConfig::new(gid);
    cfg.request_timeout = Duration::from_millis(500);
    cfg.poll_interval = Duration::from_millis(10);
    cfg.migration_interval = Duration::from_millis(10);
    cfg.gc_interval = Duration::from_millis(10);
    cfg
}

fn start_group(
    gid: GroupId,
    router: &Arc<LocalRouter>,
    source: &Arc<StaticSource>,
) -> (Arc<ShardNode>, Arc<LocalLog>) {
    let (log, decisions) = LocalLog::new();
    let node = ShardNode::new(node_config(gid), log.clone());
    node.spawn(decisions, source.clone(), router.clone());
    router.register(addr(gid), node.clone());
    (node, log)
}

/// A config assigning every shard per `shards`, with one server per listed
/// group.
fn config(num: u64, shards: [GroupId; SHARD_COUNT], gids: &[GroupId]) -> ShardConfig {
    ShardConfig {
        num,
        shards,
        groups: gids.iter().map(|gid| (*gid, vec![addr(*gid)])).collect(),
    }
}

fn put(key: &str, value: &str, client_id: u64, request_id: u64) -> KvOp {
    KvOp::Put {
        key: key.into(),
        value: value.into(),
        id: OpId { client_id, request_id },
    }
}

fn append(key: &str, value: &str, client_id: u64, request_id: u64) -> KvOp {
    KvOp::Append {
        key: key.into(),
        value: value.into(),
        id: OpId { client_id, request_id },
    }
}

/// Wait until the node sits at config `num` with every shard `Serving`.
async fn await_settled(node: &Arc<ShardNode>, num: u64) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let (current, _) = node.config_nums().await;
        let mut settled = current == num;
        if settled {
            for shard in 0..SHARD_COUNT {
                if node.shard_status(shard).await != ShardStatus::Serving {
                    settled = false;
                    break;
                }
            }
        }
        if settled {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node did not settle at config {num} (currently at {current})"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Retry a read until the node serves `want`; migrations make `WrongGroup`
/// a transient answer.
async fn await_value(node: &Arc<ShardNode>, key: &str, want: &str) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        match node.get(key.to_string()).await {
            Ok(value) if value == want => return,
            Ok(_) | Err(SkiptaError::WrongGroup) | Err(SkiptaError::Timeout) => {}
            Err(other) => panic!("unexpected error reading {key}: {other:?}"),
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node never served {key}={want}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn serves_reads_and_writes_once_configured() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, _log) = start_group(100, &router, &source);

    source.push(config(1, [100; SHARD_COUNT], &[100]));
    await_settled(&node, 1).await;

    node.put_append(put("a", "1", 1, 1)).await.unwrap();
    assert_eq!(node.get("a".into()).await.unwrap(), "1");

    node.put_append(append("a", "2", 1, 2)).await.unwrap();
    assert_eq!(node.get("a".into()).await.unwrap(), "12");

    assert_eq!(node.get("missing".into()).await, Err(SkiptaError::NoKey));
}

#[tokio::test]
async fn retried_mutation_applies_exactly_once() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, _log) = start_group(100, &router, &source);

    source.push(config(1, [100; SHARD_COUNT], &[100]));
    await_settled(&node, 1).await;

    node.put_append(append("k", "x", 7, 5)).await.unwrap();
    // The client never saw the reply and retries the same request id.
    node.put_append(append("k", "x", 7, 5)).await.unwrap();

    assert_eq!(node.get("k".into()).await.unwrap(), "x");
}

#[tokio::test]
async fn unowned_shard_is_rejected_without_consensus() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, _log) = start_group(100, &router, &source);

    let mut shards = [100; SHARD_COUNT];
    shards[key_to_shard("a")] = 200;
    source.push(config(1, shards, &[100, 200]));
    await_settled(&node, 1).await;

    assert_eq!(
        node.put_append(put("a", "1", 1, 1)).await,
        Err(SkiptaError::WrongGroup)
    );
    assert_eq!(node.get("a".into()).await, Err(SkiptaError::WrongGroup));
}

#[tokio::test]
async fn shard_migrates_with_data_and_is_garbage_collected() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (g1, _log1) = start_group(100, &router, &source);
    let (g2, _log2) = start_group(200, &router, &source);

    source.push(config(1, [100; SHARD_COUNT], &[100, 200]));
    await_settled(&g1, 1).await;
    g1.put_append(put("a", "1", 1, 1)).await.unwrap();

    // Reassign the shard holding "a" to group 200.
    let shard = key_to_shard("a");
    let mut shards = [100; SHARD_COUNT];
    shards[shard] = 200;
    source.push(config(2, shards, &[100, 200]));

    // The new owner serves the migrated value; the old owner refuses the key.
    await_value(&g2, "a", "1").await;
    assert_eq!(g1.get("a".into()).await, Err(SkiptaError::WrongGroup));

    // Migration fully settles on both sides, and the old copy is erased.
    await_settled(&g1, 2).await;
    await_settled(&g2, 2).await;
    let leftover = g1.pull_shard(shard, 2).await.unwrap();
    assert!(leftover.data.is_empty(), "old owner kept the migrated shard");
}

#[tokio::test]
async fn duplicate_table_travels_with_the_shard() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (g1, _log1) = start_group(100, &router, &source);
    let (g2, _log2) = start_group(200, &router, &source);

    source.push(config(1, [100; SHARD_COUNT], &[100, 200]));
    await_settled(&g1, 1).await;
    g1.put_append(append("a", "x", 9, 1)).await.unwrap();

    let mut shards = [100; SHARD_COUNT];
    shards[key_to_shard("a")] = 200;
    source.push(config(2, shards, &[100, 200]));
    await_value(&g2, "a", "x").await;

    // The client retries its append against the new owner; the migrated
    // duplicate table suppresses the re-execution.
    g2.put_append(append("a", "x", 9, 1)).await.unwrap();
    assert_eq!(g2.get("a".into()).await.unwrap(), "x");
}

#[tokio::test]
async fn configs_install_strictly_in_sequence() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, _log) = start_group(100, &router, &source);

    // Two configs are already available before the node polls once.
    source.push(config(1, [100; SHARD_COUNT], &[100]));
    source.push(config(2, [100; SHARD_COUNT], &[100]));

    await_settled(&node, 2).await;
    // previous == 1 shows the node stepped through config 1 on the way.
    assert_eq!(node.config_nums().await, (2, 1));
}

#[tokio::test]
async fn out_of_sequence_config_proposal_is_ignored() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, _log) = start_group(100, &router, &source);

    node.consensus()
        .start(Command::InstallConfig(config(5, [100; SHARD_COUNT], &[100])))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(node.config_nums().await, (0, 0));
}

#[tokio::test]
async fn pull_refused_until_source_reaches_the_config() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, _log) = start_group(100, &router, &source);

    source.push(config(1, [100; SHARD_COUNT], &[100]));
    await_settled(&node, 1).await;

    assert_eq!(node.pull_shard(0, 5).await.unwrap_err(), SkiptaError::NotReady);
    // Erase for a config this group has moved past is a no-op success.
    node.erase_shard(0, 0).await.unwrap();
}

#[tokio::test]
async fn non_leader_rejects_client_operations() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (node, log) = start_group(100, &router, &source);

    source.push(config(1, [100; SHARD_COUNT], &[100]));
    await_settled(&node, 1).await;

    log.set_leader(false);
    assert!(matches!(
        node.put_append(put("a", "1", 1, 1)).await,
        Err(SkiptaError::NotLeader { .. })
    ));
}

#[tokio::test]
async fn consensus_snapshot_replaces_state_and_compacted_entries_are_dropped() {
    let router = LocalRouter::new();
    let source = Arc::new(StaticSource::new());
    let (log, _unused_decisions) = LocalLog::new();
    let node = ShardNode::new(node_config(100), log);

    // Drive the apply loop with a hand-built decision stream instead of the
    // log's own, as a follower catching up from a leader snapshot would.
    let (decisions, rx) = tokio::sync::mpsc::unbounded_channel();
    node.spawn(rx, source.clone(), router.clone());

    // State as the rest of the group had it at index 10.
    let shard_a = key_to_shard("a");
    let mut snap = ServerSnapshot::bootstrap();
    snap.shards[shard_a].put("a", "1");
    snap.current = config(3, [100; SHARD_COUNT], &[100]);
    snap.previous = config(2, [100; SHARD_COUNT], &[100]);
    decisions
        .send(Decision::InstallSnapshot { index: 10, blob: encode_snapshot(&snap) })
        .unwrap();

    // An entry from the compacted prefix is redelivered; it must not apply.
    decisions
        .send(Decision::Apply {
            index: 4,
            command: Command::Op(put("stale", "x", 1, 1)),
        })
        .unwrap();
    // Replay continues past the snapshot on top of the restored state.
    decisions
        .send(Decision::Apply {
            index: 11,
            command: Command::Op(append("a", "2", 1, 2)),
        })
        .unwrap();

    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        if let Ok(migrated) = node.pull_shard(shard_a, 3).await {
            if migrated.data.get("a").map(String::as_str) == Some("12") {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapshot plus replayed entries never produced a=12"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(node.config_nums().await, (3, 2));
    let stale_shard = node.pull_shard(key_to_shard("stale"), 3).await.unwrap();
    assert!(stale_shard.data.is_empty(), "compacted entry was re-applied");
}

#[tokio::test]
async fn snapshot_restores_state_across_restart() {
    let dir = std::env::temp_dir().join(format!("skipta-cluster-{}", rand::random::<u64>()));
    let source = Arc::new(StaticSource::new());
    source.push(config(1, [100; SHARD_COUNT], &[100]));

    {
        let router = LocalRouter::new();
        let (log, decisions) = LocalLog::open(dir.clone()).unwrap();
        let mut cfg = node_config(100);
        cfg.snapshot_threshold = 1; // compact after every apply
        let node = ShardNode::new(cfg, log.clone());
        node.spawn(decisions, source.clone(), router.clone());

        await_settled(&node, 1).await;
        node.put_append(put("a", "1", 1, 1)).await.unwrap();
        node.put_append(append("b", "2", 1, 2)).await.unwrap();
        assert_eq!(node.get("a".into()).await.unwrap(), "1");
        node.shutdown();
    }

    let router = LocalRouter::new();
    let (log, decisions) = LocalLog::open(dir.clone()).unwrap();
    let node = ShardNode::new(node_config(100), log.clone());
    node.spawn(decisions, source.clone(), router.clone());

    assert_eq!(node.config_nums().await, (1, 0));
    assert_eq!(node.get("a".into()).await.unwrap(), "1");
    assert_eq!(node.get("b".into()).await.unwrap(), "2");

    std::fs::remove_dir_all(dir).unwrap();
}
