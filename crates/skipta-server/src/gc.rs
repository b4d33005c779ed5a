//! Leader-only shard garbage-collection coordinator.
//!
//! For every shard we installed but whose previous owner has not yet erased
//! its copy (`GcPending`), notify that group's servers. The erase itself is
//! the remote group's own consensus-ordered `AckGc`; once any server
//! confirms it committed, we close our side out with a local `AckGc`.

use std::sync::Arc;

use skipta_types::{Command, SkiptaError};

use crate::node::{EraseTask, ShardNode};
use crate::transport::PeerTransport;

pub(crate) fn spawn(node: Arc<ShardNode>, transport: Arc<dyn PeerTransport>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(node.config().gc_interval);
        loop {
            ticker.tick().await;
            if node.is_dead() {
                break;
            }
            if !node.consensus().is_leader() {
                continue;
            }
            for task in node.gc_plan().await {
                erase_one(&node, transport.as_ref(), &task).await;
            }
        }
    });
}

async fn erase_one(node: &Arc<ShardNode>, transport: &dyn PeerTransport, task: &EraseTask) {
    for addr in &task.servers {
        match transport.erase_shard(addr, task.shard, task.config_num).await {
            Ok(()) => {
                // The old copy is gone; flip our GcPending shard back to
                // plain Serving through our own log.
                match node.consensus().start(Command::AckGc {
                    shard: task.shard,
                    config_num: task.config_num,
                }) {
                    Ok(_) | Err(SkiptaError::NotLeader { .. }) => {}
                    Err(err) => {
                        tracing::warn!(shard = task.shard, error = %err, "failed to submit gc ack");
                    }
                }
                return;
            }
            Err(err) => {
                tracing::debug!(
                    shard = task.shard,
                    num = task.config_num,
                    addr = addr.as_str(),
                    error = %err,
                    "shard erase attempt failed"
                );
            }
        }
    }
    tracing::warn!(
        shard = task.shard,
        num = task.config_num,
        "no previous owner reachable for shard erase; will retry"
    );
}
