//! Process-lifecycle signal handle (§4.C).
//!
//! Mirrors the source's shared exit-handle: a single place that latches
//! "this process is stopping" and lets every long-running loop (dispatch
//! fan-out, pipeline stage workers, registration heartbeat) observe it
//! without polling. Re-expressed with [`CancellationToken`] instead of the
//! source's `std::promise`/static-singleton pair, and exposed as an
//! explicit value rather than a lazily-initialized global.
use tokio_util::sync::CancellationToken;

/// One process's stop latch. `master`/`worker`/`agent` are independent so
/// a component that only cares about its own role's shutdown can await
/// just that token, while `stop_all` raises every one of them at once
/// (used on fatal errors that should tear down the whole process).
#[derive(Clone, Default)]
pub struct SignalHandle {
    master: CancellationToken,
    worker: CancellationToken,
    agent: CancellationToken,
}

impl SignalHandle {
    pub fn new() -> Self {
        SignalHandle::default()
    }

    pub fn stop_master(&self) {
        self.master.cancel();
    }

    pub fn stop_worker(&self) {
        self.worker.cancel();
    }

    pub fn stop_agent(&self) {
        self.agent.cancel();
    }

    pub fn stop_all(&self) {
        self.master.cancel();
        self.worker.cancel();
        self.agent.cancel();
    }

    pub fn has_stopped_master(&self) -> bool {
        self.master.is_cancelled()
    }

    pub fn has_stopped_worker(&self) -> bool {
        self.worker.is_cancelled()
    }

    pub fn has_stopped_agent(&self) -> bool {
        self.agent.is_cancelled()
    }

    pub fn has_stopped_any(&self) -> bool {
        self.master.is_cancelled() || self.worker.is_cancelled() || self.agent.is_cancelled()
    }

    pub async fn master_wait(&self) {
        self.master.cancelled().await;
    }

    pub async fn worker_wait(&self) {
        self.worker.cancelled().await;
    }

    pub async fn agent_wait(&self) {
        self.agent.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_worker_only_signals_worker_wait() {
        let sig = SignalHandle::new();
        sig.stop_worker();
        sig.worker_wait().await;
        assert!(sig.has_stopped_worker());
        assert!(!sig.has_stopped_master());
        assert!(!sig.has_stopped_agent());
    }

    #[tokio::test]
    async fn stop_all_raises_every_role() {
        let sig = SignalHandle::new();
        sig.stop_all();
        assert!(sig.has_stopped_master());
        assert!(sig.has_stopped_worker());
        assert!(sig.has_stopped_agent());
    }

    #[test]
    fn clone_shares_the_same_latch() {
        let sig = SignalHandle::new();
        let clone = sig.clone();
        sig.stop_master();
        assert!(clone.has_stopped_master());
    }
}
