use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::coordinator::{AgentContext, DistributedCoordinator, TensorInfo};
use crate::proto;
use crate::rpc::AsyncClient;

/// Implements `MSDistributedWorker` (§6): agents register with the worker
/// hosting a distributed servable's coordinator, and pull the rank table
/// they should use via `AgentConfigAcquire`.
pub struct DistributedWorkerService {
    coordinator: Arc<DistributedCoordinator>,
    rank_table_content: String,
}

impl DistributedWorkerService {
    pub fn new(coordinator: Arc<DistributedCoordinator>, rank_table_content: String) -> Self {
        DistributedWorkerService {
            coordinator,
            rank_table_content,
        }
    }

    fn tensor_infos(wire: &[proto::TensorInfo]) -> Vec<TensorInfo> {
        wire.iter()
            .map(|t| TensorInfo {
                dtype: t.dtype.clone(),
                dims: t.dims.clone(),
            })
            .collect()
    }
}

#[tonic::async_trait]
impl proto::ms_distributed_worker_server::MsDistributedWorker for DistributedWorkerService {
    async fn agent_register(
        &self,
        request: Request<proto::AgentRegisterRequest>,
    ) -> Result<Response<proto::AgentRegisterReply>, Status> {
        let req = request.into_inner();
        for spec in &req.agent_specs {
            let client = AsyncClient::connect_lazy(spec.agent_address.clone())
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            let agent = AgentContext {
                rank_id: spec.rank_id,
                client,
                input_infos: Self::tensor_infos(&spec.input_infos),
                output_infos: Self::tensor_infos(&spec.output_infos),
                batch_size: spec.batch_size,
            };
            self.coordinator
                .register_agent(agent)
                .map_err(|e| super::to_status(crate::error::ServingError::Coordinator(e)))?;
        }
        Ok(Response::new(proto::AgentRegisterReply {
            error_code: 0,
            error_msg: String::new(),
        }))
    }

    async fn agent_exit(
        &self,
        request: Request<proto::AgentExitRequest>,
    ) -> Result<Response<proto::AgentExitReply>, Status> {
        let req = request.into_inner();
        let _ = req.agent_address;
        Ok(Response::new(proto::AgentExitReply {}))
    }

    async fn agent_failed(
        &self,
        request: Request<proto::AgentFailedRequest>,
    ) -> Result<Response<proto::AgentFailedReply>, Status> {
        let req = request.into_inner();
        tracing::warn!(agent = %req.agent_address, error = %req.error_msg, "agent reported failure");
        Ok(Response::new(proto::AgentFailedReply {}))
    }

    async fn agent_config_acquire(
        &self,
        _request: Request<proto::ConfigAcquireRequest>,
    ) -> Result<Response<proto::ConfigAcquireReply>, Status> {
        Ok(Response::new(proto::ConfigAcquireReply {
            rank_table_content: self.rank_table_content.clone(),
        }))
    }
}
