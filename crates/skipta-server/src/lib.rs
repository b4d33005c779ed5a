//! One replica group's server in the Skipta sharded key-value store:
//! consensus-ordered apply loop, at-most-once duplicate detection, shard
//! migration and garbage collection across groups, and snapshot-based log
//! compaction.

mod convert;
mod gc;
mod kv_service;
mod migration;
mod node;
mod peer_service;
mod poller;
mod snapshot;
mod state;
mod transport;

pub use convert::{error_to_status, status_to_error};
pub use kv_service::KvServiceImpl;
pub use node::{NodeConfig, ShardNode};
pub use peer_service::PeerServiceImpl;
pub use snapshot::{encode as encode_snapshot, restore as restore_snapshot, ServerSnapshot};
pub use state::{DedupTable, ShardStore};
pub use transport::{GrpcTransport, LocalRouter, PeerTransport};

use std::net::SocketAddr;
use std::sync::Arc;

use skipta_proto::v1::kv_service_server::KvServiceServer;
use skipta_proto::v1::peer_service_server::PeerServiceServer;
use tonic_reflection::server::Builder as ReflectionBuilder;

/// Serve the client-facing KV surface.
pub async fn serve_client(addr: SocketAddr, node: Arc<ShardNode>) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(skipta_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, gid = node.gid(), "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(KvServiceServer::new(KvServiceImpl::new(node)))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}

/// Serve the group-to-group migration surface.
pub async fn serve_peer(addr: SocketAddr, node: Arc<ShardNode>) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(skipta_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, gid = node.gid(), "peer gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(PeerServiceServer::new(PeerServiceImpl::new(node)))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}
