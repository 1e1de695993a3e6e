use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::dispatcher::{Dispatcher, WorkerContext, WorkerMethodInfo};
use crate::error::DispatchError;
use crate::proto;
use crate::rpc::AsyncClient;
use crate::signal::SignalHandle;

use super::to_status;

/// Implements both client-facing `MSService::Predict` (fronted by the
/// master) and worker-facing `MSMaster` registration RPCs (§4.H).
#[derive(Clone)]
pub struct MasterService {
    dispatcher: Arc<Dispatcher>,
    signal: SignalHandle,
    max_message_size_bytes: usize,
}

impl MasterService {
    pub fn new(dispatcher: Arc<Dispatcher>, signal: SignalHandle) -> Self {
        MasterService {
            dispatcher,
            signal,
            max_message_size_bytes: crate::config::MAX_MESSAGE_SIZE_CAP_BYTES,
        }
    }

    /// Same as [`MasterService::new`], but caps the re-dispatched worker
    /// client's message size at `max_message_size_bytes` (§6) instead of
    /// the crate-wide ceiling.
    pub fn with_max_message_size(
        dispatcher: Arc<Dispatcher>,
        signal: SignalHandle,
        max_message_size_bytes: usize,
    ) -> Self {
        MasterService {
            dispatcher,
            signal,
            max_message_size_bytes,
        }
    }

    fn worker_from_spec(spec: &proto::WorkerSpec) -> Result<WorkerContext, Status> {
        let client = AsyncClient::connect_lazy(spec.worker_address.clone())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        Ok(WorkerContext::remote(
            spec.worker_address.clone(),
            spec.version_number,
            spec.methods
                .iter()
                .map(|m| WorkerMethodInfo {
                    name: m.method_name.clone(),
                })
                .collect(),
            client,
        ))
    }
}

#[tonic::async_trait]
impl proto::ms_service_server::MsService for MasterService {
    async fn predict(
        &self,
        request: Request<proto::PredictRequest>,
    ) -> Result<Response<proto::PredictReply>, Status> {
        let req = request.into_inner();
        let spec = req
            .spec
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing servable spec"))?;

        let worker = self
            .dispatcher
            .dispatch(&spec.name, &spec.method_name, spec.version_number)
            .map_err(|e| to_status(e.into()))?;

        // §4.H point 3: a worker living in this process is called
        // directly, skipping the RPC layer entirely.
        if let Some(local) = worker.in_process_worker() {
            let reply = local.predict_local(req).await?;
            return Ok(Response::new(reply));
        }

        let client = worker
            .client()
            .expect("worker has either a client or an in-process handle");
        let mut rpc = proto::ms_worker_client::MsWorkerClient::new(client.channel())
            .max_decoding_message_size(self.max_message_size_bytes)
            .max_encoding_message_size(self.max_message_size_bytes);
        let reply = rpc
            .predict(Request::new(req))
            .await
            .map_err(|status| to_status(client.map_status(status)))?;
        Ok(reply)
    }
}

#[tonic::async_trait]
impl proto::ms_master_server::MsMaster for MasterService {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterReply>, Status> {
        let req = request.into_inner();
        if req.worker_specs.is_empty() {
            return Err(Status::invalid_argument("worker_specs cannot be empty"));
        }
        for spec in &req.worker_specs {
            let worker = Self::worker_from_spec(spec)?;
            self.dispatcher.register(&spec.servable_name, worker);
        }
        Ok(Response::new(proto::RegisterReply {
            error_code: 0,
            error_msg: String::new(),
        }))
    }

    async fn exit(
        &self,
        request: Request<proto::ExitRequest>,
    ) -> Result<Response<proto::ExitReply>, Status> {
        let req = request.into_inner();
        self.dispatcher.unregister(&req.address);
        Ok(Response::new(proto::ExitReply {}))
    }

    async fn add_worker(
        &self,
        request: Request<proto::AddWorkerRequest>,
    ) -> Result<Response<proto::AddWorkerReply>, Status> {
        let req = request.into_inner();
        let spec = req
            .worker_spec
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing worker_spec"))?;
        let worker = Self::worker_from_spec(spec)?;
        self.dispatcher.register(&spec.servable_name, worker);
        Ok(Response::new(proto::AddWorkerReply {
            error_code: 0,
            error_msg: String::new(),
        }))
    }

    async fn remove_worker(
        &self,
        request: Request<proto::RemoveWorkerRequest>,
    ) -> Result<Response<proto::RemoveWorkerReply>, Status> {
        let req = request.into_inner();
        let spec = req
            .worker_spec
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("missing worker_spec"))?;
        self.dispatcher.unregister(&spec.worker_address);
        Ok(Response::new(proto::RemoveWorkerReply {}))
    }

    async fn ping(
        &self,
        request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PongReply>, Status> {
        let req = request.into_inner();
        Ok(Response::new(proto::PongReply { seq: req.seq }))
    }
}

impl From<DispatchError> for crate::error::ServingError {
    fn from(e: DispatchError) -> Self {
        crate::error::ServingError::Dispatch(e)
    }
}
