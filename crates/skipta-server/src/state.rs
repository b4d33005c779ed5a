//! Per-shard state machines and the duplicate table.
//!
//! Everything here is pure in-memory data, mutated only by the apply loop
//! under the node lock.

use std::collections::BTreeMap;

use skipta_types::{ClientId, LastOp, OpReply, ShardStatus};

/// One shard's key/value mapping plus its migration status.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ShardStore {
    pub data: BTreeMap<String, String>,
    pub status: ShardStatus,
}

impl ShardStore {
    pub fn new() -> Self {
        ShardStore {
            data: BTreeMap::new(),
            status: ShardStatus::Serving,
        }
    }

    pub fn get(&self, key: &str) -> OpReply {
        match self.data.get(key) {
            Some(value) => OpReply::Value(value.clone()),
            None => OpReply::NoKey,
        }
    }

    pub fn put(&mut self, key: &str, value: &str) -> OpReply {
        self.data.insert(key.to_string(), value.to_string());
        OpReply::Done
    }

    pub fn append(&mut self, key: &str, value: &str) -> OpReply {
        self.data.entry(key.to_string()).or_default().push_str(value);
        OpReply::Done
    }

    /// Back to the unowned, empty state (post-GC erase).
    pub fn reset(&mut self) {
        self.data.clear();
        self.status = ShardStatus::Serving;
    }
}

impl Default for ShardStore {
    fn default() -> Self {
        Self::new()
    }
}

/// client id → last applied mutation and its cached reply. Grows without
/// bound by design: evicting entries would silently weaken the at-most-once
/// guarantee.
pub type DedupTable = BTreeMap<ClientId, LastOp>;

/// Whether `request_id` from `client` has already been applied.
pub fn is_duplicate(dedup: &DedupTable, client: ClientId, request_id: u64) -> bool {
    dedup
        .get(&client)
        .map(|last| last.request_id >= request_id)
        .unwrap_or(false)
}

/// Merge a duplicate table received with a migrated shard: per client, keep
/// whichever side has seen the larger request id. Never regresses a client's
/// recorded progress.
pub fn merge_dedup(local: &mut DedupTable, incoming: &DedupTable) {
    for (client, op) in incoming {
        match local.get(client) {
            Some(have) if have.request_id >= op.request_id => {}
            _ => {
                local.insert(*client, op.clone());
            }
        }
    }
}
