use std::sync::Arc;

use tonic::{Request, Response, Status};

use skipta_proto::v1::kv_service_server::KvService;
use skipta_proto::v1::{
    GetRequest, GetResponse, PutAppendOp, PutAppendRequest, PutAppendResponse,
};
use skipta_types::{KvOp, OpId};

use crate::convert::error_to_status;
use crate::node::ShardNode;

pub struct KvServiceImpl {
    node: Arc<ShardNode>,
}

impl KvServiceImpl {
    pub fn new(node: Arc<ShardNode>) -> Self {
        KvServiceImpl { node }
    }
}

#[tonic::async_trait]
impl KvService for KvServiceImpl {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let value = self.node.get(req.key).await.map_err(error_to_status)?;
        Ok(Response::new(GetResponse { value }))
    }

    async fn put_append(
        &self,
        request: Request<PutAppendRequest>,
    ) -> Result<Response<PutAppendResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let id = OpId { client_id: req.client_id, request_id: req.request_id };
        let op = match PutAppendOp::try_from(req.op) {
            Ok(PutAppendOp::Put) => KvOp::Put { key: req.key, value: req.value, id },
            Ok(PutAppendOp::Append) => KvOp::Append { key: req.key, value: req.value, id },
            _ => return Err(Status::invalid_argument("op must be PUT or APPEND")),
        };
        self.node.put_append(op).await.map_err(error_to_status)?;
        Ok(Response::new(PutAppendResponse {}))
    }
}
