//! Group-to-group transport.
//!
//! The coordinators talk to peer groups through [`PeerTransport`] so the
//! core never depends on a concrete wire: production uses [`GrpcTransport`],
//! tests wire nodes together in-process with [`LocalRouter`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use skipta_proto::v1 as pb;
use skipta_proto::v1::peer_service_client::PeerServiceClient;
use skipta_types::{MigratedShard, SkiptaError};

use crate::convert;
use crate::node::ShardNode;

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn pull_shard(
        &self,
        addr: &str,
        shard: usize,
        config_num: u64,
    ) -> Result<MigratedShard, SkiptaError>;

    async fn erase_shard(
        &self,
        addr: &str,
        shard: usize,
        config_num: u64,
    ) -> Result<(), SkiptaError>;
}

// ---------------------------------------------------------------------------
// GrpcTransport
// ---------------------------------------------------------------------------

/// Peer transport over tonic, with one lazily-connected channel per address.
pub struct GrpcTransport {
    clients: tokio::sync::Mutex<HashMap<String, PeerServiceClient<Channel>>>,
}

impl GrpcTransport {
    pub fn new() -> Self {
        GrpcTransport {
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, addr: &str) -> Result<PeerServiceClient<Channel>, SkiptaError> {
        let mut g = self.clients.lock().await;
        if let Some(client) = g.get(addr) {
            return Ok(client.clone());
        }
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| SkiptaError::Transport(e.to_string()))?;
        let client = PeerServiceClient::new(endpoint.connect_lazy());
        g.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for GrpcTransport {
    async fn pull_shard(
        &self,
        addr: &str,
        shard: usize,
        config_num: u64,
    ) -> Result<MigratedShard, SkiptaError> {
        let mut client = self.client(addr).await?;
        let response = client
            .pull_shard(pb::PullShardRequest { shard: shard as u32, config_num })
            .await
            .map_err(convert::status_to_error)?
            .into_inner();
        Ok(MigratedShard {
            shard,
            config_num,
            data: response.data.into_iter().collect(),
            dedup: response
                .dedup
                .into_iter()
                .map(|(client_id, op)| (client_id, convert::last_op_from_proto(op)))
                .collect(),
        })
    }

    async fn erase_shard(
        &self,
        addr: &str,
        shard: usize,
        config_num: u64,
    ) -> Result<(), SkiptaError> {
        let mut client = self.client(addr).await?;
        client
            .erase_shard(pb::EraseShardRequest { shard: shard as u32, config_num })
            .await
            .map_err(convert::status_to_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LocalRouter
// ---------------------------------------------------------------------------

/// In-process peer routing: addresses resolve to registered [`ShardNode`]s
/// directly. Intended for tests; not a production transport.
pub struct LocalRouter {
    nodes: std::sync::RwLock<HashMap<String, Arc<ShardNode>>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalRouter {
            nodes: std::sync::RwLock::new(HashMap::new()),
        })
    }

    pub fn register(&self, addr: impl Into<String>, node: Arc<ShardNode>) {
        self.nodes.write().unwrap().insert(addr.into(), node);
    }

    fn lookup(&self, addr: &str) -> Result<Arc<ShardNode>, SkiptaError> {
        self.nodes
            .read()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| SkiptaError::Transport(format!("unknown address {addr}")))
    }
}

#[async_trait]
impl PeerTransport for LocalRouter {
    async fn pull_shard(
        &self,
        addr: &str,
        shard: usize,
        config_num: u64,
    ) -> Result<MigratedShard, SkiptaError> {
        self.lookup(addr)?.pull_shard(shard, config_num).await
    }

    async fn erase_shard(
        &self,
        addr: &str,
        shard: usize,
        config_num: u64,
    ) -> Result<(), SkiptaError> {
        self.lookup(addr)?.erase_shard(shard, config_num).await
    }
}
