use std::collections::BTreeMap;

pub type NodeId = u64;
pub type ClientId = u64;
/// Replica-group id; `0` is the unassigned sentinel (no group owns the shard).
pub type GroupId = u64;

/// The key space is split into this many shards, fixed for the lifetime of
/// the cluster.
pub const SHARD_COUNT: usize = 10;

/// Deterministic key → shard mapping: first byte of the key, mod
/// [`SHARD_COUNT`]. Empty keys hash to shard 0.
pub fn key_to_shard(key: &str) -> usize {
    key.as_bytes().first().map(|b| *b as usize).unwrap_or(0) % SHARD_COUNT
}

/// A versioned assignment of shards to replica groups, produced by the shard
/// controller.
///
/// Configs are immutable once observed. `num` advances by exactly 1 between
/// configs a server installs; config 0 is the bootstrap config with every
/// shard unassigned and no groups.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShardConfig {
    pub num: u64,
    /// shard index → owning group (`0` = unassigned).
    pub shards: [GroupId; SHARD_COUNT],
    /// group id → server addresses, in connection-attempt order.
    pub groups: BTreeMap<GroupId, Vec<String>>,
}

impl ShardConfig {
    /// The bootstrap config: all shards unassigned, no groups.
    pub fn initial() -> Self {
        ShardConfig {
            num: 0,
            shards: [0; SHARD_COUNT],
            groups: BTreeMap::new(),
        }
    }

    /// The group owning `shard` under this config, or `None` if unassigned.
    pub fn owner(&self, shard: usize) -> Option<GroupId> {
        match self.shards[shard] {
            0 => None,
            gid => Some(gid),
        }
    }

    pub fn servers(&self, gid: GroupId) -> &[String] {
        self.groups.get(&gid).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Where a local shard copy stands in the migration lifecycle.
///
/// * `Serving`   — owned (or unowned and empty); servable if the current
///   config assigns the shard here.
/// * `Pulling`   — newly assigned here; waiting for data from the previous
///   owner, not yet servable.
/// * `MovingOut` — no longer assigned here; data retained until the new
///   owner confirms its install, never servable.
/// * `GcPending` — newly assigned here and installed; servable, but the
///   previous owner has not yet confirmed erasing its stale copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShardStatus {
    Serving,
    Pulling,
    MovingOut,
    GcPending,
}

/// Client-chosen identity of a mutating operation, for at-most-once
/// deduplication. `request_id` is strictly increasing per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OpId {
    pub client_id: ClientId,
    pub request_id: u64,
}

/// A client key-value operation submitted through consensus.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum KvOp {
    Get { key: String },
    Put { key: String, value: String, id: OpId },
    Append { key: String, value: String, id: OpId },
}

impl KvOp {
    pub fn key(&self) -> &str {
        match self {
            KvOp::Get { key } | KvOp::Put { key, .. } | KvOp::Append { key, .. } => key,
        }
    }

    /// `None` for reads, which are never deduplicated.
    pub fn id(&self) -> Option<OpId> {
        match self {
            KvOp::Get { .. } => None,
            KvOp::Put { id, .. } | KvOp::Append { id, .. } => Some(*id),
        }
    }
}

/// Outcome of applying a committed command, delivered to the blocked RPC
/// handler and cached in the duplicate table for mutations.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum OpReply {
    /// `Get` hit.
    Value(String),
    /// `Get` miss.
    NoKey,
    /// Mutation applied (or deduplicated).
    Done,
    /// Ownership changed between submission and apply; nothing was mutated.
    WrongGroup,
}

/// Last applied mutation per client, with its cached reply.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LastOp {
    pub request_id: u64,
    pub reply: OpReply,
}

/// One shard's contents handed from its previous owner to its new owner.
///
/// The duplicate table travels wholesale: a client's updates may touch
/// multiple shards, so the receiver merges per-client entries monotonically
/// rather than replacing them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigratedShard {
    pub shard: usize,
    pub config_num: u64,
    pub data: BTreeMap<String, String>,
    pub dedup: BTreeMap<ClientId, LastOp>,
}

/// Everything that flows through the consensus log. Closed set: the apply
/// loop matches exhaustively.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// A client read or write.
    Op(KvOp),
    /// Install the next configuration (must be `current.num + 1`).
    InstallConfig(ShardConfig),
    /// Install a shard pulled from its previous owner.
    InstallShard(MigratedShard),
    /// Close out migration of `shard` for `config_num`: the new owner flips
    /// `GcPending` → `Serving`, the old owner erases its `MovingOut` copy.
    AckGc { shard: usize, config_num: u64 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SkiptaError {
    #[error("key not found")]
    NoKey,
    #[error("shard not owned by this group")]
    WrongGroup,
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("no consensus decision within the timeout")]
    Timeout,
    #[error("source group has not installed the requested config yet")]
    NotReady,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("consensus error: {0}")]
    Consensus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_to_shard_is_first_byte_mod_shard_count() {
        assert_eq!(key_to_shard(""), 0);
        assert_eq!(key_to_shard("a"), (b'a' as usize) % SHARD_COUNT);
        // Only the first byte matters.
        assert_eq!(key_to_shard("a-long-key"), key_to_shard("a"));
    }

    #[test]
    fn initial_config_is_fully_unassigned() {
        let cfg = ShardConfig::initial();
        assert_eq!(cfg.num, 0);
        assert!(cfg.groups.is_empty());
        for shard in 0..SHARD_COUNT {
            assert_eq!(cfg.owner(shard), None);
        }
    }

    #[test]
    fn get_ops_carry_no_dedup_id() {
        let get = KvOp::Get { key: "k".into() };
        assert!(get.id().is_none());

        let put = KvOp::Put {
            key: "k".into(),
            value: "v".into(),
            id: OpId { client_id: 7, request_id: 3 },
        };
        assert_eq!(put.id(), Some(OpId { client_id: 7, request_id: 3 }));
        assert_eq!(put.key(), "k");
    }
}
