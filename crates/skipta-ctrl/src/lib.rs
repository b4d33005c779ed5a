//! Shard-controller access.
//!
//! The controller itself is an external service; this crate holds the
//! client side: the [`ConfigSource`] seam the configuration poller consumes,
//! a gRPC clerk that rotates through controller endpoints until it finds the
//! leader, and a scriptable in-memory source for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use skipta_proto::v1 as pb;
use skipta_proto::v1::ctrl_service_client::CtrlServiceClient;
use skipta_types::{GroupId, ShardConfig, SkiptaError, SHARD_COUNT};

/// Source of versioned shard configurations. `num == -1` means latest; a
/// `num` beyond the newest known config also yields the latest (controller
/// contract).
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    async fn query(&self, num: i64) -> Result<ShardConfig, SkiptaError>;
}

pub fn config_from_proto(pb: pb::ShardConfig) -> ShardConfig {
    let mut shards = [0 as GroupId; SHARD_COUNT];
    for (i, gid) in pb.shards.into_iter().take(SHARD_COUNT).enumerate() {
        shards[i] = gid;
    }
    ShardConfig {
        num: pb.num,
        shards,
        groups: pb
            .groups
            .into_iter()
            .map(|(gid, list)| (gid, list.servers))
            .collect(),
    }
}

pub fn config_to_proto(cfg: &ShardConfig) -> pb::ShardConfig {
    pb::ShardConfig {
        num: cfg.num,
        shards: cfg.shards.to_vec(),
        groups: cfg
            .groups
            .iter()
            .map(|(gid, servers)| (*gid, pb::ServerList { servers: servers.clone() }))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// CtrlClerk — gRPC client with leader rotation
// ---------------------------------------------------------------------------

/// How many full passes over the endpoint list a single call makes before
/// giving up; callers (the poller, skiptactl) retry at their own pace.
const CLERK_ROUNDS: usize = 3;

pub struct CtrlClerk {
    clients: Vec<CtrlServiceClient<Channel>>,
    /// Index of the endpoint that last answered; tried first next time.
    leader: AtomicUsize,
    client_id: u64,
    request_id: AtomicU64,
}

impl CtrlClerk {
    /// Lazy-connects to every controller endpoint; no I/O happens until the
    /// first call.
    pub fn connect(endpoints: &[String]) -> Result<Self, SkiptaError> {
        if endpoints.is_empty() {
            return Err(SkiptaError::Transport("no controller endpoints".into()));
        }
        let mut clients = Vec::with_capacity(endpoints.len());
        for addr in endpoints {
            let endpoint = Endpoint::from_shared(format!("http://{addr}"))
                .map_err(|e| SkiptaError::Transport(e.to_string()))?;
            clients.push(CtrlServiceClient::new(endpoint.connect_lazy()));
        }
        Ok(CtrlClerk {
            clients,
            leader: AtomicUsize::new(0),
            client_id: rand::random(),
            request_id: AtomicU64::new(0),
        })
    }

    fn should_rotate(status: &tonic::Status) -> bool {
        matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
    }

    /// Try `call` against each endpoint starting from the remembered leader,
    /// rotating on "wrong leader"/timeout answers and transport failures.
    async fn with_leader<T, F, Fut>(&self, mut call: F) -> Result<T, SkiptaError>
    where
        F: FnMut(CtrlServiceClient<Channel>) -> Fut,
        Fut: std::future::Future<Output = Result<T, tonic::Status>>,
    {
        let n = self.clients.len();
        let mut idx = self.leader.load(Ordering::Relaxed) % n;
        let mut last_err = None;
        for _ in 0..n * CLERK_ROUNDS {
            match call(self.clients[idx].clone()).await {
                Ok(out) => {
                    self.leader.store(idx, Ordering::Relaxed);
                    return Ok(out);
                }
                Err(status) if Self::should_rotate(&status) => {
                    last_err = Some(status);
                    idx = (idx + 1) % n;
                }
                Err(status) => return Err(SkiptaError::Transport(status.to_string())),
            }
        }
        Err(SkiptaError::Transport(
            last_err.map(|s| s.to_string()).unwrap_or_else(|| "no controller reachable".into()),
        ))
    }

    fn next_op(&self) -> (u64, u64) {
        (self.client_id, self.request_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn join(&self, groups: BTreeMap<GroupId, Vec<String>>) -> Result<(), SkiptaError> {
        let (client_id, request_id) = self.next_op();
        let groups: std::collections::HashMap<u64, pb::ServerList> = groups
            .into_iter()
            .map(|(gid, servers)| (gid, pb::ServerList { servers }))
            .collect();
        self.with_leader(move |mut c| {
            let groups = groups.clone();
            async move {
                c.join(pb::JoinRequest { groups, client_id, request_id })
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn leave(&self, gids: Vec<GroupId>) -> Result<(), SkiptaError> {
        let (client_id, request_id) = self.next_op();
        self.with_leader(move |mut c| {
            let gids = gids.clone();
            async move {
                c.leave(pb::LeaveRequest { gids, client_id, request_id })
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn move_shard(&self, shard: usize, gid: GroupId) -> Result<(), SkiptaError> {
        let (client_id, request_id) = self.next_op();
        self.with_leader(move |mut c| async move {
            c.r#move(pb::MoveRequest {
                shard: shard as u32,
                gid,
                client_id,
                request_id,
            })
            .await
            .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl ConfigSource for CtrlClerk {
    async fn query(&self, num: i64) -> Result<ShardConfig, SkiptaError> {
        let config = self
            .with_leader(move |mut c| async move {
                c.query(pb::QueryRequest { num }).await.map(|r| r.into_inner().config)
            })
            .await?
            .ok_or_else(|| SkiptaError::Transport("controller returned no config".into()))?;
        Ok(config_from_proto(config))
    }
}

// ---------------------------------------------------------------------------
// StaticSource — scripted configs for tests
// ---------------------------------------------------------------------------

/// In-memory [`ConfigSource`] holding a sequence of configs, starting at the
/// bootstrap config. Tests push new configs to drive reconfiguration.
pub struct StaticSource {
    configs: Mutex<Vec<ShardConfig>>,
}

impl StaticSource {
    pub fn new() -> Self {
        StaticSource {
            configs: Mutex::new(vec![ShardConfig::initial()]),
        }
    }

    /// Append the next config; its `num` must continue the sequence.
    pub fn push(&self, config: ShardConfig) {
        let mut g = self.configs.lock().unwrap();
        assert_eq!(config.num, g.len() as u64, "configs must be pushed in order");
        g.push(config);
    }

    pub fn latest_num(&self) -> u64 {
        self.configs.lock().unwrap().len() as u64 - 1
    }
}

impl Default for StaticSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for StaticSource {
    async fn query(&self, num: i64) -> Result<ShardConfig, SkiptaError> {
        let g = self.configs.lock().unwrap();
        let idx = if num < 0 || num as usize >= g.len() {
            g.len() - 1
        } else {
            num as usize
        };
        Ok(g[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num: u64, owner: GroupId) -> ShardConfig {
        let mut cfg = ShardConfig::initial();
        cfg.num = num;
        cfg.shards = [owner; SHARD_COUNT];
        cfg.groups.insert(owner, vec!["a:1".into()]);
        cfg
    }

    #[tokio::test]
    async fn static_source_serves_exact_and_latest() {
        let source = StaticSource::new();
        source.push(config(1, 100));
        source.push(config(2, 101));

        assert_eq!(source.query(0).await.unwrap().num, 0);
        assert_eq!(source.query(1).await.unwrap().num, 1);
        // -1 and out-of-range both mean latest.
        assert_eq!(source.query(-1).await.unwrap().num, 2);
        assert_eq!(source.query(99).await.unwrap().num, 2);
        assert_eq!(source.latest_num(), 2);
    }

    #[test]
    fn config_proto_round_trip() {
        let cfg = config(3, 7);
        let back = config_from_proto(config_to_proto(&cfg));
        assert_eq!(back, cfg);
    }

    #[test]
    fn short_proto_shard_list_pads_unassigned() {
        let pb = pb::ShardConfig { num: 1, shards: vec![5, 5], groups: Default::default() };
        let cfg = config_from_proto(pb);
        assert_eq!(cfg.shards[0], 5);
        assert_eq!(cfg.shards[2], 0);
    }
}
