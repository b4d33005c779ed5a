//! Snapshot encoding for log compaction and crash recovery.
//!
//! The blob always represents state strictly after applying all log entries
//! up to the index recorded by the consensus module; replaying subsequent
//! entries on top reproduces the exact unsnapshotted state.

use skipta_types::{ShardConfig, SHARD_COUNT};

use crate::state::{DedupTable, ShardStore};

/// The full server state captured in a snapshot.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ServerSnapshot {
    pub shards: Vec<ShardStore>,
    pub dedup: DedupTable,
    pub current: ShardConfig,
    pub previous: ShardConfig,
}

impl ServerSnapshot {
    /// The bootstrap state: all shards empty and `Serving`, empty duplicate
    /// table, config 0 twice.
    pub fn bootstrap() -> Self {
        ServerSnapshot {
            shards: (0..SHARD_COUNT).map(|_| ShardStore::new()).collect(),
            dedup: DedupTable::new(),
            current: ShardConfig::initial(),
            previous: ShardConfig::initial(),
        }
    }
}

/// Serialize the server state.
///
/// Panics on failure: state we built ourselves must always be encodable, so
/// an error here is an unrecoverable invariant violation.
pub fn encode(snapshot: &ServerSnapshot) -> Vec<u8> {
    match bincode::serde::encode_to_vec(snapshot, bincode::config::standard()) {
        Ok(bytes) => bytes,
        Err(e) => panic!("snapshot encode failed: {e}"),
    }
}

/// Deserialize a snapshot blob; an empty blob yields the bootstrap state.
///
/// Panics on a non-empty blob that does not decode: snapshots are
/// self-produced, so corruption is an unrecoverable invariant violation.
pub fn restore(blob: &[u8]) -> ServerSnapshot {
    if blob.is_empty() {
        return ServerSnapshot::bootstrap();
    }
    match bincode::serde::decode_from_slice(blob, bincode::config::standard()) {
        Ok((snapshot, _)) => snapshot,
        Err(e) => panic!("snapshot decode failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skipta_types::{LastOp, OpReply, ShardStatus};

    #[test]
    fn empty_blob_restores_bootstrap_state() {
        let snap = restore(&[]);
        assert_eq!(snap.shards.len(), SHARD_COUNT);
        assert!(snap.shards.iter().all(|s| s.data.is_empty() && s.status == ShardStatus::Serving));
        assert!(snap.dedup.is_empty());
        assert_eq!(snap.current.num, 0);
        assert_eq!(snap.previous.num, 0);
    }

    #[test]
    fn encode_restore_round_trip_is_identity() {
        let mut snap = ServerSnapshot::bootstrap();
        snap.shards[3].put("a", "1");
        snap.shards[3].status = ShardStatus::MovingOut;
        snap.dedup.insert(9, LastOp { request_id: 4, reply: OpReply::Done });
        snap.current.num = 2;
        snap.current.shards[3] = 102;
        snap.previous.num = 1;

        let back = restore(&encode(&snap));
        assert_eq!(back.shards[3].data, snap.shards[3].data);
        assert_eq!(back.shards[3].status, ShardStatus::MovingOut);
        assert_eq!(back.dedup[&9].request_id, 4);
        assert_eq!(back.current, snap.current);
        assert_eq!(back.previous, snap.previous);
    }

    #[test]
    #[should_panic(expected = "snapshot decode failed")]
    fn corrupt_blob_is_fatal() {
        restore(&[0xff, 0x01, 0x02, 0x03]);
    }
}
