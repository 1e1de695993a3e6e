//! Master dispatcher (§4.H), grounded on the source's `Dispatcher`: a
//! table from servable name to the workers currently serving it, used to
//! pick a worker for an incoming predict call and fan out registration
//! changes.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::rpc::AsyncClient;

/// One worker's advertised methods for a servable version.
#[derive(Debug, Clone)]
pub struct WorkerMethodInfo {
    pub name: String,
}

/// A worker reachable without a network hop — e.g. `WorkerService` running
/// in the same process as the master (§4.H point 3). Implemented directly
/// by the worker-side service so in-process dispatch skips the RPC layer
/// entirely rather than looping a client back to its own listener.
#[async_trait]
pub trait LocalWorker: Send + Sync {
    async fn predict_local(
        &self,
        request: crate::proto::PredictRequest,
    ) -> Result<crate::proto::PredictReply, tonic::Status>;
}

/// A worker currently registered for some servable version. Reached either
/// over gRPC (`client`) or, when it lives in this same process, directly
/// through `in_process` — exactly one of the two is set.
#[derive(Clone)]
pub struct WorkerContext {
    pub address: String,
    pub version_number: u64,
    pub methods: Vec<WorkerMethodInfo>,
    client: Option<AsyncClient>,
    in_process: Option<Arc<dyn LocalWorker>>,
}

impl WorkerContext {
    /// A worker dispatched to over gRPC.
    pub fn remote(
        address: String,
        version_number: u64,
        methods: Vec<WorkerMethodInfo>,
        client: AsyncClient,
    ) -> Self {
        WorkerContext {
            address,
            version_number,
            methods,
            client: Some(client),
            in_process: None,
        }
    }

    /// A worker dispatched to directly, bypassing gRPC entirely (§4.H
    /// point 3's in-process short-circuit).
    pub fn in_process(
        address: String,
        version_number: u64,
        methods: Vec<WorkerMethodInfo>,
        worker: Arc<dyn LocalWorker>,
    ) -> Self {
        WorkerContext {
            address,
            version_number,
            methods,
            client: None,
            in_process: Some(worker),
        }
    }

    pub fn client(&self) -> Option<&AsyncClient> {
        self.client.as_ref()
    }

    pub fn in_process_worker(&self) -> Option<&Arc<dyn LocalWorker>> {
        self.in_process.as_ref()
    }
}

/// Servable name -> the workers currently serving some version of it.
/// Reads (one per incoming predict call) take a shared lock; registration
/// changes (rare, relative to predict traffic) take an exclusive one.
#[derive(Default)]
pub struct Dispatcher {
    servables: RwLock<HashMap<String, Vec<WorkerContext>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Add a worker context for `servable_name`. A worker already
    /// registered at the same address+version is replaced.
    pub fn register(&self, servable_name: &str, worker: WorkerContext) {
        let mut servables = self.servables.write().unwrap();
        let entry = servables.entry(servable_name.to_string()).or_default();
        entry.retain(|w| !(w.address == worker.address && w.version_number == worker.version_number));
        entry.push(worker);
    }

    /// Remove every worker at `address` across all servables (used on
    /// worker Exit/unregister).
    pub fn unregister(&self, address: &str) {
        let mut servables = self.servables.write().unwrap();
        for workers in servables.values_mut() {
            workers.retain(|w| w.address != address);
        }
        servables.retain(|_, workers| !workers.is_empty());
    }

    /// Pick a worker for `servable_name`/`method_name`/`version_number`.
    /// `version_number == 0` means "pick the highest version currently
    /// registered"; any other value requires an exact match.
    pub fn dispatch(
        &self,
        servable_name: &str,
        method_name: &str,
        version_number: u64,
    ) -> Result<WorkerContext, DispatchError> {
        let servables = self.servables.read().unwrap();
        let workers = servables
            .get(servable_name)
            .ok_or_else(|| DispatchError::ServableUnavailable(servable_name.to_string()))?;
        if workers.is_empty() {
            return Err(DispatchError::ServableUnavailable(servable_name.to_string()));
        }

        let chosen = if version_number > 0 {
            workers
                .iter()
                .find(|w| w.version_number == version_number)
                .ok_or(DispatchError::VersionNotFound {
                    servable: servable_name.to_string(),
                    version: version_number,
                })?
        } else {
            workers
                .iter()
                .max_by_key(|w| w.version_number)
                .expect("workers non-empty")
        };

        if !chosen.methods.iter().any(|m| m.name == method_name) {
            return Err(DispatchError::UnknownMethod {
                servable: servable_name.to_string(),
                method: method_name.to_string(),
            });
        }

        Ok(chosen.clone())
    }

    pub fn servable_names(&self) -> Vec<String> {
        self.servables.read().unwrap().keys().cloned().collect()
    }
}
