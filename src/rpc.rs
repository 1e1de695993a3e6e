//! Async RPC client pool (§4.J), re-expressing the source's
//! completion-queue-thread client as a generic, task-per-call async client
//! over a `tonic` channel. One [`AsyncClient`] is built per peer address
//! and cloned wherever a component needs to call it; `tonic::Channel`
//! clones are cheap (shared connection), so no separate connection pool
//! is kept on top of it.
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use crate::error::{DispatchError, ServingError};

/// A lazily-connecting handle to one peer. `address` is kept around for
/// error messages and re-dial after a connection is dropped.
#[derive(Clone)]
pub struct AsyncClient {
    address: String,
    channel: Channel,
}

impl AsyncClient {
    /// Connect (lazily — the first RPC triggers the actual handshake) to
    /// `address`, which must be a valid `http://host:port` URI.
    pub fn connect_lazy(address: impl Into<String>) -> Result<Self, ServingError> {
        let address = address.into();
        let endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| ServingError::System(format!("invalid endpoint '{address}': {e}")))?
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30));
        let channel = endpoint.connect_lazy();
        Ok(AsyncClient { address, channel })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Wrap a `tonic::Status` returned by a call on this client's channel
    /// into the unified error type, tagging it with the peer address.
    pub fn map_status(&self, status: tonic::Status) -> ServingError {
        warn!(address = %self.address, status = %status, "rpc call failed");
        ServingError::Dispatch(DispatchError::WorkerRpcFailed {
            address: self.address.clone(),
            reason: status.message().to_string(),
        })
    }
}
