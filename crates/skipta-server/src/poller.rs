//! Leader-only configuration poller.
//!
//! Asks the controller for exactly `current.num + 1` — never "latest" — so
//! configs install strictly in sequence, and holds off entirely while the
//! previous reconfiguration is still settling.

use std::sync::Arc;

use skipta_ctrl::ConfigSource;
use skipta_types::{Command, SkiptaError};

use crate::node::ShardNode;

pub(crate) fn spawn(node: Arc<ShardNode>, source: Arc<dyn ConfigSource>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(node.config().poll_interval);
        loop {
            ticker.tick().await;
            if node.is_dead() {
                break;
            }
            if !node.consensus().is_leader() {
                continue;
            }
            if let Err(err) = poll_once(&node, source.as_ref()).await {
                tracing::warn!(error = %err, "config poll failed");
            }
        }
    });
}

async fn poll_once(node: &Arc<ShardNode>, source: &dyn ConfigSource) -> Result<(), SkiptaError> {
    let Some(next) = node.next_config_to_poll().await else {
        // A shard is still migrating; one step at a time.
        return Ok(());
    };
    let config = source.query(next as i64).await?;
    if config.num != next {
        // The controller has nothing newer yet.
        return Ok(());
    }
    match node.consensus().start(Command::InstallConfig(config)) {
        Ok(_) => Ok(()),
        // Lost leadership between the tick check and the submit; harmless.
        Err(SkiptaError::NotLeader { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}
