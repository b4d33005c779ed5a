//! Leader-only shard migration coordinator.
//!
//! Each tick: plan under the lock (which shards are `Pulling` and who owned
//! them last), then pull over the network with the lock released. The pull
//! RPC itself is not replicated; only its result is, as an `InstallShard`
//! command, so every replica of this group applies the same data.

use std::sync::Arc;

use skipta_types::{Command, SkiptaError};

use crate::node::{PullTask, ShardNode};
use crate::transport::PeerTransport;

pub(crate) fn spawn(node: Arc<ShardNode>, transport: Arc<dyn PeerTransport>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(node.config().migration_interval);
        loop {
            ticker.tick().await;
            if node.is_dead() {
                break;
            }
            if !node.consensus().is_leader() {
                continue;
            }
            for task in node.migration_plan().await {
                pull_one(&node, transport.as_ref(), &task).await;
            }
        }
    });
}

/// Try the previous owner's servers in order until one hands the shard
/// over; a fully failed round is retried on the next tick.
async fn pull_one(node: &Arc<ShardNode>, transport: &dyn PeerTransport, task: &PullTask) {
    for addr in &task.servers {
        match transport.pull_shard(addr, task.shard, task.config_num).await {
            Ok(migrated) => {
                match node.consensus().start(Command::InstallShard(migrated)) {
                    Ok(_) | Err(SkiptaError::NotLeader { .. }) => {}
                    Err(err) => {
                        tracing::warn!(shard = task.shard, error = %err, "failed to submit shard install");
                    }
                }
                return;
            }
            Err(err) => {
                // Wrong leader, not ready, or unreachable; try the next
                // server of the group.
                tracing::debug!(
                    shard = task.shard,
                    num = task.config_num,
                    addr = addr.as_str(),
                    error = %err,
                    "shard pull attempt failed"
                );
            }
        }
    }
    tracing::warn!(
        shard = task.shard,
        num = task.config_num,
        "no previous owner reachable for shard pull; will retry"
    );
}
