//! Predict batcher (§4.F).
//!
//! Sits in front of a servable's model/inference backend and accumulates
//! individual predict requests into fixed-size batches before handing them
//! to the backend, padding a partial batch so the backend always sees a
//! full one. One dedicated task owns the backend and drains the queue;
//! callers `send` a request and `await` a oneshot reply.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::StageError;
use crate::instance::{Instance, Phase};
use crate::pipeline::PhaseExecutor;

/// The user-supplied inference backend a [`PredictBatcher`] drives. Takes
/// a full batch of instances and returns one output set per instance, in
/// the same order.
#[async_trait]
pub trait Model: Send + Sync {
    async fn predict_batch(
        &self,
        batch: Vec<Instance>,
    ) -> std::result::Result<Vec<Vec<(String, crate::tensor::Tensor)>>, StageError>;
}

/// Stand-in backend for servables that declare no real inference library:
/// copies every `Phase::Input` tensor straight through to the predict
/// phase's output under the same name. The real backend (§1: "a pluggable
/// library that loads a model file and executes tensors") is out of this
/// crate's scope; this is the opaque capability a worker falls back to.
pub struct PassthroughModel;

#[async_trait]
impl Model for PassthroughModel {
    async fn predict_batch(
        &self,
        batch: Vec<Instance>,
    ) -> std::result::Result<Vec<Vec<(String, crate::tensor::Tensor)>>, StageError> {
        Ok(batch
            .iter()
            .map(|inst| {
                inst.phase_map(Phase::Input)
                    .iter()
                    .map(|(name, t)| (name.clone(), t.clone()))
                    .collect()
            })
            .collect())
    }
}

struct PendingRequest {
    instance: Instance,
    reply: oneshot::Sender<std::result::Result<Vec<(String, crate::tensor::Tensor)>, StageError>>,
}

/// Handle used by callers to submit a single instance for batched predict.
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl BatcherHandle {
    pub async fn predict(
        &self,
        instance: Instance,
    ) -> std::result::Result<Vec<(String, crate::tensor::Tensor)>, StageError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                instance,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StageError::ChannelClosed)?;
        reply_rx.await.map_err(|_| StageError::ChannelClosed)?
    }
}

/// Owns the model and the batching loop. Spawn [`PredictBatcher::spawn`]
/// once per servable version; clone the returned [`BatcherHandle`] into
/// every task that needs to submit predict requests.
pub struct PredictBatcher;

impl PredictBatcher {
    /// Spawn the batching task. `batch_size` is the target (and padded-to)
    /// batch size; `max_wait` bounds how long a partial batch waits for
    /// more arrivals before it's padded and dispatched anyway.
    /// `without_batch_dim_inputs` names inputs that carry no batch
    /// dimension (§4.E): rather than packing one value per instance, the
    /// whole tensor from instance 0 is copied once into every slot.
    pub fn spawn(
        model: Arc<dyn Model>,
        batch_size: usize,
        max_wait: Duration,
        without_batch_dim_inputs: HashSet<String>,
    ) -> BatcherHandle {
        let (tx, mut rx) = mpsc::channel::<PendingRequest>(1024);
        let batch_size = batch_size.max(1);

        tokio::spawn(async move {
            loop {
                let mut batch = Vec::with_capacity(batch_size);
                let first = match rx.recv().await {
                    Some(req) => req,
                    None => break,
                };
                batch.push(first);

                let deadline = tokio::time::sleep(max_wait);
                tokio::pin!(deadline);
                while batch.len() < batch_size {
                    tokio::select! {
                        maybe_req = rx.recv() => {
                            match maybe_req {
                                Some(req) => batch.push(req),
                                None => break,
                            }
                        }
                        _ = &mut deadline => break,
                    }
                }

                let real_count = batch.len();
                let pad_count = batch_size.saturating_sub(real_count);
                if pad_count > 0 {
                    debug!(real_count, pad_count, "padding partial batch");
                }

                let mut instances = Vec::with_capacity(batch_size);
                for req in &batch {
                    instances.push(req.instance.clone());
                }
                for _ in 0..pad_count {
                    instances.push(batch[0].instance.clone());
                }

                if !without_batch_dim_inputs.is_empty() {
                    let broadcast: Vec<(String, crate::tensor::Tensor)> = without_batch_dim_inputs
                        .iter()
                        .filter_map(|name| {
                            instances[0]
                                .get(Phase::Input, name)
                                .map(|t| (name.clone(), t.clone()))
                        })
                        .collect();
                    for inst in instances.iter_mut().skip(1) {
                        for (name, tensor) in &broadcast {
                            inst.set(Phase::Input, name.clone(), tensor.clone());
                        }
                    }
                }

                match model.predict_batch(instances).await {
                    Ok(mut outputs) => {
                        outputs.truncate(real_count);
                        for (req, out) in batch.into_iter().zip(outputs) {
                            let _ = req.reply.send(Ok(out));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "batch predict failed");
                        for req in batch {
                            let _ = req.reply.send(Err(StageError::Predict(e.to_string())));
                        }
                    }
                }
            }
        });

        BatcherHandle { tx }
    }
}

/// Plugs a [`BatcherHandle`] into [`PipelineExecutor`](crate::pipeline::PipelineExecutor)'s
/// predict phase: one instance in, one submission to the batcher, its
/// output set back out.
pub struct BatcherPhaseExecutor {
    handle: BatcherHandle,
}

impl BatcherPhaseExecutor {
    pub fn new(handle: BatcherHandle) -> Self {
        BatcherPhaseExecutor { handle }
    }
}

#[async_trait]
impl PhaseExecutor for BatcherPhaseExecutor {
    async fn run(
        &self,
        instance: &Instance,
    ) -> std::result::Result<Vec<(String, crate::tensor::Tensor)>, StageError> {
        self.handle.predict(instance.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, Tensor};

    struct EchoModel;

    #[async_trait]
    impl Model for EchoModel {
        async fn predict_batch(
            &self,
            batch: Vec<Instance>,
        ) -> std::result::Result<Vec<Vec<(String, crate::tensor::Tensor)>>, StageError> {
            Ok(batch
                .iter()
                .map(|_| vec![("y".to_string(), Tensor::new_owned(DataType::U8, vec![1], vec![9]).unwrap())])
                .collect())
        }
    }

    #[tokio::test]
    async fn single_request_pads_and_returns_its_own_output() {
        let handle = PredictBatcher::spawn(Arc::new(EchoModel), 4, Duration::from_millis(20), HashSet::new());
        let out = handle.predict(Instance::new()).await.unwrap();
        assert_eq!(out[0].1.as_bytes(), &[9]);
    }

    struct CountingModel {
        seen_batch_len: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Model for CountingModel {
        async fn predict_batch(
            &self,
            batch: Vec<Instance>,
        ) -> std::result::Result<Vec<Vec<(String, crate::tensor::Tensor)>>, StageError> {
            self.seen_batch_len
                .store(batch.len(), std::sync::atomic::Ordering::SeqCst);
            Ok(batch
                .iter()
                .map(|inst| {
                    vec![(
                        "x".to_string(),
                        inst.get(Phase::Input, "x").unwrap().clone(),
                    )]
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn partial_batch_pads_with_instance_zero_not_empty() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = PredictBatcher::spawn(
            Arc::new(CountingModel {
                seen_batch_len: seen,
            }),
            4,
            Duration::from_millis(20),
            HashSet::new(),
        );
        let mut inst = Instance::new();
        inst.set(Phase::Input, "x", Tensor::new_owned(DataType::U8, vec![1], vec![5]).unwrap());
        let out = handle.predict(inst).await.unwrap();
        assert_eq!(out[0].1.as_bytes(), &[5]);
    }

    #[tokio::test]
    async fn without_batch_dim_input_is_broadcast_from_instance_zero() {
        let without_batch_dim: HashSet<String> = ["bias".to_string()].into_iter().collect();
        let handle = PredictBatcher::spawn(Arc::new(EchoBiasModel), 3, Duration::from_millis(200), without_batch_dim);

        let mut first = Instance::new();
        first.set(Phase::Input, "bias", Tensor::new_owned(DataType::U8, vec![1], vec![42]).unwrap());
        let mut second = Instance::new();
        second.set(Phase::Input, "bias", Tensor::new_owned(DataType::U8, vec![1], vec![7]).unwrap());

        let h1 = handle.clone();
        let h2 = handle.clone();
        let (r1, r2) = tokio::join!(h1.predict(first), h2.predict(second));
        let out1 = r1.unwrap();
        let out2 = r2.unwrap();
        assert_eq!(out1[0].1.as_bytes(), &[42]);
        assert_eq!(out2[0].1.as_bytes(), &[42]);
    }

    struct EchoBiasModel;

    #[async_trait]
    impl Model for EchoBiasModel {
        async fn predict_batch(
            &self,
            batch: Vec<Instance>,
        ) -> std::result::Result<Vec<Vec<(String, crate::tensor::Tensor)>>, StageError> {
            Ok(batch
                .iter()
                .map(|inst| vec![("bias".to_string(), inst.get(Phase::Input, "bias").unwrap().clone())])
                .collect())
        }
    }

    #[tokio::test]
    async fn concurrent_requests_fill_one_batch() {
        let handle = PredictBatcher::spawn(Arc::new(EchoModel), 4, Duration::from_millis(200), HashSet::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let h = handle.clone();
            handles.push(tokio::spawn(async move { h.predict(Instance::new()).await }));
        }
        for h in handles {
            let out = h.await.unwrap().unwrap();
            assert_eq!(out[0].1.as_bytes(), &[9]);
        }
    }

    struct FailingModel;

    #[async_trait]
    impl Model for FailingModel {
        async fn predict_batch(
            &self,
            _batch: Vec<Instance>,
        ) -> std::result::Result<Vec<Vec<(String, crate::tensor::Tensor)>>, StageError> {
            Err(StageError::Predict("backend died".into()))
        }
    }

    #[tokio::test]
    async fn backend_failure_propagates_to_every_waiter() {
        let handle = PredictBatcher::spawn(Arc::new(FailingModel), 2, Duration::from_millis(20), HashSet::new());
        let err = handle.predict(Instance::new()).await.unwrap_err();
        assert!(matches!(err, StageError::Predict(_)));
    }
}
