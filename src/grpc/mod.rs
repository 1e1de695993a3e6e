//! gRPC transport and service wiring (§4.K): `tonic`-generated server
//! traits for the five services in §6, each implemented as a thin
//! adapter over the core components in the rest of this crate.
mod agent_service;
mod distributed_service;
mod master_service;
mod worker_service;

pub use agent_service::AgentService;
pub use distributed_service::DistributedWorkerService;
pub use master_service::MasterService;
pub use worker_service::WorkerService;

use crate::error::ServingError;

/// Shared conversion: map the crate's unified error into a `tonic::Status`,
/// using [`ServingError::code`] to pick the closest gRPC status code.
pub(crate) fn to_status(err: ServingError) -> tonic::Status {
    use crate::error::ErrorCode;
    let message = err.to_string();
    match err.code() {
        ErrorCode::Success => tonic::Status::ok(message),
        ErrorCode::InvalidInputs => tonic::Status::invalid_argument(message),
        ErrorCode::Failed => tonic::Status::internal(message),
        ErrorCode::SystemError => tonic::Status::internal(message),
        ErrorCode::WorkerUnavailable => tonic::Status::unavailable(message),
        ErrorCode::ServableUnavailable => tonic::Status::unavailable(message),
    }
}
