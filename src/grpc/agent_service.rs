use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::instance::{InstanceContext, Phase};
use crate::pipeline::PipelineExecutor;
use crate::proto;
use crate::signal::SignalHandle;
use crate::wire;

/// Implements `MSAgent` (§6): one rank's predict entry point, plus the
/// exit/ping RPCs the worker's registration watchdog uses.
pub struct AgentService {
    rank_id: u32,
    pipeline: Arc<PipelineExecutor>,
    signal: SignalHandle,
}

impl AgentService {
    pub fn new(rank_id: u32, pipeline: Arc<PipelineExecutor>, signal: SignalHandle) -> Self {
        AgentService {
            rank_id,
            pipeline,
            signal,
        }
    }
}

#[tonic::async_trait]
impl proto::ms_agent_server::MsAgent for AgentService {
    async fn predict(
        &self,
        request: Request<proto::DistributedPredictRequest>,
    ) -> Result<Response<proto::DistributedPredictReply>, Status> {
        let req = request.into_inner();
        if req.rank_id != self.rank_id {
            return Err(Status::invalid_argument(format!(
                "request targeted rank {} but this agent is rank {}",
                req.rank_id, self.rank_id
            )));
        }

        let mut instances = Vec::with_capacity(req.instances.len());
        let mut contexts = Vec::with_capacity(req.instances.len());
        for (idx, wire_inst) in req.instances.iter().enumerate() {
            let instance = wire::instance_from_wire(wire_inst)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            instances.push(instance);
            contexts.push(InstanceContext::new(0, idx, "predict"));
        }

        let results = self.pipeline.run_batch(instances, contexts).await;
        let first_error = results.iter().find_map(|(_, ctx)| ctx.error.clone());

        let out_instances = results
            .iter()
            .map(|(inst, _)| wire::instance_to_wire(inst, Phase::Postprocess))
            .collect();

        let (error_code, error_msg) = match first_error {
            Some(slot) => (slot.code as i32, slot.message),
            None => (crate::error::ErrorCode::Success as i32, String::new()),
        };

        Ok(Response::new(proto::DistributedPredictReply {
            rank_id: self.rank_id,
            instances: out_instances,
            error_code,
            error_msg,
        }))
    }

    async fn exit(
        &self,
        _request: Request<proto::ExitRequest>,
    ) -> Result<Response<proto::ExitReply>, Status> {
        self.signal.stop_agent();
        Ok(Response::new(proto::ExitReply {}))
    }

    async fn ping(
        &self,
        request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PongReply>, Status> {
        let req = request.into_inner();
        Ok(Response::new(proto::PongReply { seq: req.seq }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_echoes_sequence_number() {
        let service = AgentService::new(0, Arc::new(PipelineExecutor::new(1)), SignalHandle::new());
        let reply = proto::ms_agent_server::MsAgent::ping(&service, Request::new(proto::PingRequest { seq: 42 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.seq, 42);
    }

    #[tokio::test]
    async fn predict_rejects_mismatched_rank() {
        let service = AgentService::new(1, Arc::new(PipelineExecutor::new(1)), SignalHandle::new());
        let err = proto::ms_agent_server::MsAgent::predict(
            &service,
            Request::new(proto::DistributedPredictRequest {
                rank_id: 0,
                instances: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn exit_raises_agent_signal() {
        let signal = SignalHandle::new();
        let service = AgentService::new(0, Arc::new(PipelineExecutor::new(1)), signal.clone());
        proto::ms_agent_server::MsAgent::exit(&service, Request::new(proto::ExitRequest { address: "a".into() }))
            .await
            .unwrap();
        assert!(signal.has_stopped_agent());
    }
}
