use std::sync::Arc;

use tonic::{Request, Response, Status};

use skipta_proto::v1::peer_service_server::PeerService;
use skipta_proto::v1::{
    EraseShardRequest, EraseShardResponse, PullShardRequest, PullShardResponse,
};
use skipta_types::SHARD_COUNT;

use crate::convert::{error_to_status, last_op_to_proto};
use crate::node::ShardNode;

pub struct PeerServiceImpl {
    node: Arc<ShardNode>,
}

impl PeerServiceImpl {
    pub fn new(node: Arc<ShardNode>) -> Self {
        PeerServiceImpl { node }
    }
}

fn shard_index(raw: u32) -> Result<usize, Status> {
    let shard = raw as usize;
    if shard >= SHARD_COUNT {
        return Err(Status::invalid_argument(format!(
            "shard {shard} out of range (0..{SHARD_COUNT})"
        )));
    }
    Ok(shard)
}

#[tonic::async_trait]
impl PeerService for PeerServiceImpl {
    async fn pull_shard(
        &self,
        request: Request<PullShardRequest>,
    ) -> Result<Response<PullShardResponse>, Status> {
        let req = request.into_inner();
        let shard = shard_index(req.shard)?;
        let migrated = self
            .node
            .pull_shard(shard, req.config_num)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(PullShardResponse {
            data: migrated.data.into_iter().collect(),
            dedup: migrated
                .dedup
                .iter()
                .map(|(client_id, op)| (*client_id, last_op_to_proto(op)))
                .collect(),
        }))
    }

    async fn erase_shard(
        &self,
        request: Request<EraseShardRequest>,
    ) -> Result<Response<EraseShardResponse>, Status> {
        let req = request.into_inner();
        let shard = shard_index(req.shard)?;
        self.node
            .erase_shard(shard, req.config_num)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(EraseShardResponse {}))
    }
}
