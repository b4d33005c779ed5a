//! The replica-group server node: one lock over all in-memory state, a
//! single apply loop consuming the consensus decision stream, and the
//! client/peer entry points that block on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard};

use skipta_consensus::{ConsensusLog, Decision};
use skipta_ctrl::ConfigSource;
use skipta_types::{
    key_to_shard, Command, GroupId, KvOp, MigratedShard, OpReply, ShardStatus, SkiptaError,
    SHARD_COUNT,
};

use crate::snapshot::{self, ServerSnapshot};
use crate::state::{self, DedupTable, ShardStore};
use crate::transport::PeerTransport;
use crate::{gc, migration, poller};

/// Tunables for one node. Defaults mirror the intervals the system was
/// designed around; tests shrink them.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub gid: GroupId,
    /// How long a client call waits for its consensus decision.
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub migration_interval: Duration,
    pub gc_interval: Duration,
    /// Snapshot when the consensus module reports at least this many bytes
    /// of state; 0 disables snapshotting.
    pub snapshot_threshold: u64,
}

impl NodeConfig {
    pub fn new(gid: GroupId) -> Self {
        NodeConfig {
            gid,
            request_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            migration_interval: Duration::from_millis(50),
            gc_interval: Duration::from_millis(50),
            snapshot_threshold: 0,
        }
    }
}

/// Everything the single lock guards. Mutated only while held; no network
/// or disk I/O happens under it.
struct NodeState {
    shards: Vec<ShardStore>,
    dedup: DedupTable,
    current: skipta_types::ShardConfig,
    previous: skipta_types::ShardConfig,
    /// log index → single-slot channel back to the blocked submitter.
    notify: HashMap<u64, mpsc::Sender<OpReply>>,
    /// Redelivery guard: decisions at or below this index are dropped.
    last_applied: u64,
}

impl NodeState {
    fn from_snapshot(snap: ServerSnapshot, last_applied: u64) -> Self {
        NodeState {
            shards: snap.shards,
            dedup: snap.dedup,
            current: snap.current,
            previous: snap.previous,
            notify: HashMap::new(),
            last_applied,
        }
    }

    fn to_snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            shards: self.shards.clone(),
            dedup: self.dedup.clone(),
            current: self.current.clone(),
            previous: self.previous.clone(),
        }
    }

    /// Local ownership check: the shard is assigned to `gid` by the current
    /// config and its copy is servable.
    fn servable(&self, gid: GroupId, shard: usize) -> bool {
        self.current.shards[shard] == gid
            && matches!(
                self.shards[shard].status,
                ShardStatus::Serving | ShardStatus::GcPending
            )
    }
}

/// A shard to pull from its previous owner, planned under the lock and
/// executed outside it.
pub(crate) struct PullTask {
    pub shard: usize,
    pub config_num: u64,
    pub servers: Vec<String>,
}

/// A previous owner to notify that migration of `shard` is complete.
pub(crate) struct EraseTask {
    pub shard: usize,
    pub config_num: u64,
    pub servers: Vec<String>,
}

pub struct ShardNode {
    cfg: NodeConfig,
    consensus: Arc<dyn ConsensusLog>,
    state: Mutex<NodeState>,
    dead: AtomicBool,
}

impl ShardNode {
    /// Build a node, restoring state from the consensus module's persisted
    /// snapshot (bootstrap state if there is none). Call [`ShardNode::spawn`]
    /// to start the apply loop and the periodic tasks.
    pub fn new(cfg: NodeConfig, consensus: Arc<dyn ConsensusLog>) -> Arc<Self> {
        let snap = snapshot::restore(&consensus.read_snapshot());
        Arc::new(ShardNode {
            cfg,
            consensus,
            state: Mutex::new(NodeState::from_snapshot(snap, 0)),
            dead: AtomicBool::new(false),
        })
    }

    /// Start the apply loop, configuration poller, migration coordinator and
    /// GC coordinator.
    pub fn spawn(
        self: &Arc<Self>,
        decisions: mpsc::UnboundedReceiver<Decision>,
        source: Arc<dyn ConfigSource>,
        transport: Arc<dyn PeerTransport>,
    ) {
        tokio::spawn(self.clone().apply_loop(decisions));
        poller::spawn(self.clone(), source);
        migration::spawn(self.clone(), transport.clone());
        gc::spawn(self.clone(), transport);
    }

    /// Stop the periodic loops. In-flight calls finish on their own; nothing
    /// is aborted.
    pub fn shutdown(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn gid(&self) -> GroupId {
        self.cfg.gid
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusLog> {
        &self.consensus
    }

    pub(crate) fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    // -- introspection (tests, admin surfaces) ------------------------------

    pub async fn shard_status(&self, shard: usize) -> ShardStatus {
        self.state.lock().await.shards[shard].status
    }

    /// `(current.num, previous.num)`.
    pub async fn config_nums(&self) -> (u64, u64) {
        let g = self.state.lock().await;
        (g.current.num, g.previous.num)
    }

    // -- client facade ------------------------------------------------------

    pub async fn get(self: &Arc<Self>, key: String) -> Result<String, SkiptaError> {
        {
            let g = self.state.lock().await;
            if !g.servable(self.cfg.gid, key_to_shard(&key)) {
                return Err(SkiptaError::WrongGroup);
            }
        }
        let reply = self.submit_and_wait(Command::Op(KvOp::Get { key })).await?;
        match reply {
            OpReply::Value(value) => Ok(value),
            OpReply::NoKey => Err(SkiptaError::NoKey),
            OpReply::WrongGroup => Err(SkiptaError::WrongGroup),
            OpReply::Done => Err(SkiptaError::Consensus("mismatched reply for read".into())),
        }
    }

    /// `op` must be `Put` or `Append`; `Get` goes through [`ShardNode::get`].
    pub async fn put_append(self: &Arc<Self>, op: KvOp) -> Result<(), SkiptaError> {
        let id = op
            .id()
            .ok_or_else(|| SkiptaError::Consensus("put_append requires an op id".into()))?;
        {
            let g = self.state.lock().await;
            if !g.servable(self.cfg.gid, key_to_shard(op.key())) {
                return Err(SkiptaError::WrongGroup);
            }
            // Fast path: already applied, answer from the cache without
            // consuming a log entry.
            if state::is_duplicate(&g.dedup, id.client_id, id.request_id) {
                let cached = g.dedup[&id.client_id].reply.clone();
                return Self::mutation_result(cached);
            }
        }
        let reply = self.submit_and_wait(Command::Op(op)).await?;
        Self::mutation_result(reply)
    }

    fn mutation_result(reply: OpReply) -> Result<(), SkiptaError> {
        match reply {
            OpReply::Done => Ok(()),
            OpReply::WrongGroup => Err(SkiptaError::WrongGroup),
            OpReply::Value(_) | OpReply::NoKey => {
                Err(SkiptaError::Consensus("mismatched reply for mutation".into()))
            }
        }
    }

    // -- peer surface -------------------------------------------------------

    /// Hand over one shard plus the full duplicate table. Refuses while this
    /// group has not itself installed `config_num`, bounding cross-group
    /// skew.
    pub async fn pull_shard(
        &self,
        shard: usize,
        config_num: u64,
    ) -> Result<MigratedShard, SkiptaError> {
        if !self.consensus.is_leader() {
            return Err(SkiptaError::NotLeader { leader: None });
        }
        let g = self.state.lock().await;
        if config_num > g.current.num {
            return Err(SkiptaError::NotReady);
        }
        Ok(MigratedShard {
            shard,
            config_num,
            data: g.shards[shard].data.clone(),
            dedup: g.dedup.clone(),
        })
    }

    /// The new owner confirmed its install for `config_num`: erase our
    /// retained copy through our own consensus log. Idempotent; an `Ok`
    /// means the erase has committed (or had already happened).
    pub async fn erase_shard(
        self: &Arc<Self>,
        shard: usize,
        config_num: u64,
    ) -> Result<(), SkiptaError> {
        if !self.consensus.is_leader() {
            return Err(SkiptaError::NotLeader { leader: None });
        }
        {
            let g = self.state.lock().await;
            if config_num < g.current.num {
                // We already moved past that reconfiguration; the copy is
                // long gone.
                return Ok(());
            }
            if config_num > g.current.num {
                return Err(SkiptaError::NotReady);
            }
            if g.shards[shard].status != ShardStatus::MovingOut {
                return Ok(());
            }
        }
        let reply = self
            .submit_and_wait(Command::AckGc { shard, config_num })
            .await?;
        Self::mutation_result(reply)
    }

    // -- consensus submission ----------------------------------------------

    /// Submit through consensus and block on the notification slot for the
    /// assigned index, bounded by the request timeout. The slot is buffered
    /// so the apply loop never blocks delivering into it, and it is removed
    /// lazily afterwards whichever way the wait ended.
    async fn submit_and_wait(self: &Arc<Self>, command: Command) -> Result<OpReply, SkiptaError> {
        let started = self.consensus.start(command)?;
        let (tx, mut rx) = mpsc::channel(1);
        self.state.lock().await.notify.insert(started.index, tx);

        let outcome = tokio::time::timeout(self.cfg.request_timeout, rx.recv()).await;

        let node = self.clone();
        let index = started.index;
        tokio::spawn(async move {
            node.state.lock().await.notify.remove(&index);
        });

        match outcome {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => Err(SkiptaError::Timeout),
        }
    }

    // -- apply loop ---------------------------------------------------------

    async fn apply_loop(self: Arc<Self>, mut decisions: mpsc::UnboundedReceiver<Decision>) {
        while let Some(decision) = decisions.recv().await {
            if self.is_dead() {
                break;
            }
            match decision {
                Decision::Apply { index, command } => {
                    let mut g = self.state.lock().await;
                    if index <= g.last_applied {
                        // Redelivered after a restart; already reflected.
                        continue;
                    }
                    let reply = self.apply_command(&mut g, command);
                    g.last_applied = index;
                    if let Some(tx) = g.notify.get(&index) {
                        // Buffered slot; never blocks, and an abandoned
                        // waiter just leaves the value unread.
                        let _ = tx.try_send(reply);
                    }
                    self.maybe_snapshot(g, index);
                }
                Decision::InstallSnapshot { index, blob } => {
                    let mut g = self.state.lock().await;
                    if index <= g.last_applied {
                        continue;
                    }
                    let snap = snapshot::restore(&blob);
                    g.shards = snap.shards;
                    g.dedup = snap.dedup;
                    g.current = snap.current;
                    g.previous = snap.previous;
                    g.last_applied = index;
                    tracing::info!(index, "installed snapshot from consensus");
                }
            }
        }
    }

    /// Encode under the lock, hand the blob to consensus after releasing it
    /// (compaction may touch disk).
    fn maybe_snapshot(&self, g: MutexGuard<'_, NodeState>, index: u64) {
        if self.cfg.snapshot_threshold == 0
            || self.consensus.state_size() < self.cfg.snapshot_threshold
        {
            return;
        }
        let blob = snapshot::encode(&g.to_snapshot());
        drop(g);
        tracing::debug!(index, bytes = blob.len(), "compacting log into snapshot");
        self.consensus.snapshot(index, blob);
    }

    fn apply_command(&self, g: &mut NodeState, command: Command) -> OpReply {
        match command {
            Command::Op(op) => self.apply_op(g, op),
            Command::InstallConfig(config) => self.apply_config(g, config),
            Command::InstallShard(migrated) => self.apply_install(g, migrated),
            Command::AckGc { shard, config_num } => self.apply_gc_ack(g, shard, config_num),
        }
    }

    fn apply_op(&self, g: &mut NodeState, op: KvOp) -> OpReply {
        // Duplicate check before anything else: a retried mutation must see
        // its original reply even if ownership has since moved.
        if let Some(id) = op.id() {
            if state::is_duplicate(&g.dedup, id.client_id, id.request_id) {
                return g.dedup[&id.client_id].reply.clone();
            }
        }
        let shard = key_to_shard(op.key());
        // Ownership may have changed between submission and apply.
        if !g.servable(self.cfg.gid, shard) {
            return OpReply::WrongGroup;
        }
        match op {
            KvOp::Get { key } => g.shards[shard].get(&key),
            KvOp::Put { key, value, id } => {
                let reply = g.shards[shard].put(&key, &value);
                g.dedup.insert(
                    id.client_id,
                    skipta_types::LastOp { request_id: id.request_id, reply: reply.clone() },
                );
                reply
            }
            KvOp::Append { key, value, id } => {
                let reply = g.shards[shard].append(&key, &value);
                g.dedup.insert(
                    id.client_id,
                    skipta_types::LastOp { request_id: id.request_id, reply: reply.clone() },
                );
                reply
            }
        }
    }

    fn apply_config(&self, g: &mut NodeState, config: skipta_types::ShardConfig) -> OpReply {
        // Strictly sequential installs; anything else is a stale or
        // premature proposal.
        if config.num != g.current.num + 1 {
            return OpReply::Done;
        }
        let gid = self.cfg.gid;
        for shard in 0..SHARD_COUNT {
            let owned = g.current.shards[shard] == gid;
            let owns_next = config.shards[shard] == gid;
            if !owned && owns_next {
                if g.current.shards[shard] != 0 {
                    g.shards[shard].status = ShardStatus::Pulling;
                }
                // No previous owner: serve the empty shard immediately.
            } else if owned && !owns_next {
                g.shards[shard].status = ShardStatus::MovingOut;
            }
        }
        tracing::info!(num = config.num, gid, "installed configuration");
        g.previous = std::mem::replace(&mut g.current, config);
        OpReply::Done
    }

    fn apply_install(&self, g: &mut NodeState, migrated: MigratedShard) -> OpReply {
        // Idempotent against repeated pulls: only a shard still waiting for
        // this config's data accepts it.
        if migrated.config_num != g.current.num
            || g.shards[migrated.shard].status != ShardStatus::Pulling
        {
            return OpReply::Done;
        }
        let store = &mut g.shards[migrated.shard];
        for (key, value) in migrated.data {
            store.data.insert(key, value);
        }
        // Servable from here on; GcPending marks the old owner's copy as not
        // yet erased so the GC coordinator keeps notifying it.
        store.status = ShardStatus::GcPending;
        state::merge_dedup(&mut g.dedup, &migrated.dedup);
        tracing::info!(shard = migrated.shard, num = migrated.config_num, "installed shard");
        OpReply::Done
    }

    fn apply_gc_ack(&self, g: &mut NodeState, shard: usize, config_num: u64) -> OpReply {
        if config_num != g.current.num {
            return OpReply::Done;
        }
        match g.shards[shard].status {
            // New owner: the previous owner confirmed its erase.
            ShardStatus::GcPending => {
                g.shards[shard].status = ShardStatus::Serving;
                tracing::debug!(shard, num = config_num, "migration fully settled");
            }
            // Previous owner: drop the stale copy.
            ShardStatus::MovingOut => {
                g.shards[shard].reset();
                tracing::info!(shard, num = config_num, "erased migrated-away shard");
            }
            ShardStatus::Serving | ShardStatus::Pulling => {}
        }
        OpReply::Done
    }

    // -- plans for the periodic coordinators --------------------------------

    /// The next config number to ask the controller for, or `None` while the
    /// previous reconfiguration has not fully settled (any shard still
    /// `Pulling`, `MovingOut` or `GcPending`).
    pub(crate) async fn next_config_to_poll(&self) -> Option<u64> {
        let g = self.state.lock().await;
        if g.shards.iter().any(|s| s.status != ShardStatus::Serving) {
            return None;
        }
        Some(g.current.num + 1)
    }

    /// Shards awaiting data, with the previous owner's server list.
    pub(crate) async fn migration_plan(&self) -> Vec<PullTask> {
        let g = self.state.lock().await;
        (0..SHARD_COUNT)
            .filter(|&shard| g.shards[shard].status == ShardStatus::Pulling)
            .filter_map(|shard| {
                let gid = g.previous.owner(shard)?;
                Some(PullTask {
                    shard,
                    config_num: g.current.num,
                    servers: g.previous.servers(gid).to_vec(),
                })
            })
            .collect()
    }

    /// Installed shards whose previous owner still has to be told to erase.
    pub(crate) async fn gc_plan(&self) -> Vec<EraseTask> {
        let g = self.state.lock().await;
        (0..SHARD_COUNT)
            .filter(|&shard| g.shards[shard].status == ShardStatus::GcPending)
            .filter_map(|shard| {
                let gid = g.previous.owner(shard)?;
                Some(EraseTask {
                    shard,
                    config_num: g.current.num,
                    servers: g.previous.servers(gid).to_vec(),
                })
            })
            .collect()
    }
}
