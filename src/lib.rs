//! Distributed inference-serving execution plane: a Master dispatches
//! predict calls to Workers, each running a declared pipeline over a
//! servable; a Worker may itself front a Distributed Servable Coordinator
//! fanning calls out to per-rank Agents.
pub mod batcher;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod grpc;
pub mod instance;
pub mod pipeline;
pub mod proto;
pub mod ranktable;
pub mod registration;
pub mod registry;
pub mod rest;
pub mod rpc;
pub mod shm;
pub mod signal;
pub mod tensor;
pub mod wire;

pub use error::{ErrorCode, Result, ServingError};
