use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::{RegistryError, ServingError};
use crate::instance::{InstanceContext, Phase};
use crate::pipeline::PipelineExecutor;
use crate::proto;
use crate::registry::ServableRegistry;
use crate::signal::SignalHandle;
use crate::wire;

/// Implements `MSWorker` (§6): the master calls `predict` on a chosen
/// worker, and `exit` to ask it to leave the cluster gracefully.
///
/// §4.B's `Check()` gate lives here: a predict call for a servable/method
/// the registry doesn't know about never reaches the pipeline.
pub struct WorkerService {
    pipeline: Arc<PipelineExecutor>,
    registry: Arc<ServableRegistry>,
    signal: SignalHandle,
}

impl WorkerService {
    pub fn new(
        pipeline: Arc<PipelineExecutor>,
        registry: Arc<ServableRegistry>,
        signal: SignalHandle,
    ) -> Self {
        WorkerService {
            pipeline,
            registry,
            signal,
        }
    }
}

#[tonic::async_trait]
impl proto::ms_worker_server::MsWorker for WorkerService {
    async fn predict(
        &self,
        request: Request<proto::PredictRequest>,
    ) -> Result<Response<proto::PredictReply>, Status> {
        let req = request.into_inner();
        let spec = req
            .spec
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing servable spec"))?;

        let signature = self
            .registry
            .get(&spec.name)
            .map_err(|e| crate::grpc::to_status(ServingError::Registry(e)))?;
        if signature.method(&spec.method_name).is_none() {
            return Err(crate::grpc::to_status(ServingError::Registry(
                RegistryError::UnknownMethod {
                    servable: spec.name.clone(),
                    method: spec.method_name.clone(),
                },
            )));
        }

        if req.instances.is_empty() {
            return Err(Status::invalid_argument("instances count cannot be 0"));
        }

        let mut instances = Vec::with_capacity(req.instances.len());
        let mut contexts = Vec::with_capacity(req.instances.len());
        for (idx, wire_inst) in req.instances.iter().enumerate() {
            let instance = wire::instance_from_wire(wire_inst)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            instances.push(instance);
            contexts.push(InstanceContext::new(0, idx, spec.method_name.clone()));
        }

        let results = self.pipeline.run_batch(instances, contexts).await;

        let mut out_instances = Vec::with_capacity(results.len());
        let mut error_slots = Vec::with_capacity(results.len());
        for (instance, ctx) in results {
            out_instances.push(wire::instance_to_wire(&instance, Phase::Postprocess));
            error_slots.push(ctx.error);
        }

        let errors = wire::merge_errors(&error_slots);
        // §4.D error-list rule: a single collapsed error entry carries no
        // parallel instance list.
        if errors.len() == 1 {
            out_instances.clear();
        }

        Ok(Response::new(proto::PredictReply {
            spec: Some(spec),
            instances: out_instances,
            errors,
        }))
    }

    async fn exit(
        &self,
        _request: Request<proto::ExitRequest>,
    ) -> Result<Response<proto::ExitReply>, Status> {
        self.signal.stop_worker();
        Ok(Response::new(proto::ExitReply {}))
    }
}

/// Lets a [`MasterService`](crate::grpc::MasterService) in the same
/// process dispatch to this worker without opening a gRPC loopback
/// connection to itself (§4.H point 3).
#[tonic::async_trait]
impl crate::dispatcher::LocalWorker for WorkerService {
    async fn predict_local(
        &self,
        request: proto::PredictRequest,
    ) -> Result<proto::PredictReply, Status> {
        proto::ms_worker_server::MsWorker::predict(self, Request::new(request))
            .await
            .map(Response::into_inner)
    }
}
