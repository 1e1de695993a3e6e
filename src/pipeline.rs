//! Worker pipeline executor (§4.E).
//!
//! A servable's request flows through up to three user-implemented phases
//! in order: preprocess, predict, postprocess. Each phase runs on its own
//! fixed-size task pool so a slow preprocessor can't starve predict, and a
//! failure on one instance is isolated to that instance — siblings in the
//! same batch keep flowing through the remaining phases.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ServingError, StageError};
use crate::instance::{Instance, InstanceContext, Phase};

/// User-implemented computation for one pipeline phase.
///
/// Implementations are registered per servable+phase; `run` is invoked
/// once per instance (never pre-batched — batching across instances is
/// [`crate::batcher::PredictBatcher`]'s job, sitting in front of the
/// predict phase only).
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn run(&self, instance: &Instance) -> std::result::Result<Vec<(String, crate::tensor::Tensor)>, StageError>;
}

/// A boxed, shared phase executor plus the fixed concurrency it's allowed.
struct PhaseSlot {
    executor: Arc<dyn PhaseExecutor>,
    semaphore: Arc<Semaphore>,
}

/// Runs a servable's declared phases over a stream of instances.
///
/// `pool_size` bounds how many instances may run concurrently per phase,
/// mirroring the source's fixed worker-thread pools for pre/postprocess —
/// predict itself is expected to hand off to [`crate::batcher::PredictBatcher`]
/// rather than running inline on this pool.
pub struct PipelineExecutor {
    preprocess: Option<PhaseSlot>,
    predict: Option<PhaseSlot>,
    postprocess: Option<PhaseSlot>,
}

impl PipelineExecutor {
    pub fn new(pool_size: usize) -> Self {
        let _ = pool_size;
        PipelineExecutor {
            preprocess: None,
            predict: None,
            postprocess: None,
        }
    }

    pub fn with_phase(
        mut self,
        phase: Phase,
        executor: Arc<dyn PhaseExecutor>,
        pool_size: usize,
    ) -> Self {
        let slot = PhaseSlot {
            executor,
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
        };
        match phase {
            Phase::Preprocess => self.preprocess = Some(slot),
            Phase::Predict => self.predict = Some(slot),
            Phase::Postprocess => self.postprocess = Some(slot),
            Phase::Input => {}
        }
        self
    }

    fn slot(&self, phase: Phase) -> Option<&PhaseSlot> {
        match phase {
            Phase::Preprocess => self.preprocess.as_ref(),
            Phase::Predict => self.predict.as_ref(),
            Phase::Postprocess => self.postprocess.as_ref(),
            Phase::Input => None,
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        instance: &mut Instance,
        ctx: &mut InstanceContext,
    ) {
        if ctx.has_failed() {
            return;
        }
        let Some(slot) = self.slot(phase) else {
            return;
        };
        let _permit = match slot.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => {
                ctx.fail(&ServingError::Shutdown);
                return;
            }
        };
        match slot.executor.run(instance).await {
            Ok(outputs) => {
                for (name, tensor) in outputs {
                    instance.set(phase, name, tensor);
                }
            }
            Err(e) => {
                warn!(phase = ?phase, instance = ctx.instance_index, error = %e, "stage failed");
                ctx.fail(&ServingError::Stage(e));
            }
        }
    }

    /// Drive one instance through preprocess -> predict -> postprocess,
    /// stopping early (but still returning) on the first phase failure.
    pub async fn run_instance(&self, mut instance: Instance, mut ctx: InstanceContext) -> (Instance, InstanceContext) {
        self.run_phase(Phase::Preprocess, &mut instance, &mut ctx).await;
        self.run_phase(Phase::Predict, &mut instance, &mut ctx).await;
        self.run_phase(Phase::Postprocess, &mut instance, &mut ctx).await;
        (instance, ctx)
    }

    /// Run a batch of instances concurrently (bounded by each phase's
    /// pool), returning results in the same order they were submitted.
    pub async fn run_batch(
        &self,
        instances: Vec<Instance>,
        contexts: Vec<InstanceContext>,
    ) -> Vec<(Instance, InstanceContext)> {
        debug!(count = instances.len(), "running batch through pipeline");
        let self_ref: &Self = self;
        let tasks = instances
            .into_iter()
            .zip(contexts)
            .map(|(inst, ctx)| self_ref.run_instance(inst, ctx));
        futures::future::join_all(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, Tensor};

    struct DoubleExecutor;

    #[async_trait]
    impl PhaseExecutor for DoubleExecutor {
        async fn run(&self, instance: &Instance) -> std::result::Result<Vec<(String, Tensor)>, StageError> {
            let t = instance
                .get(Phase::Input, "x")
                .ok_or_else(|| StageError::Predict("missing x".into()))?;
            let mut bytes = t.as_bytes().to_vec();
            for b in bytes.iter_mut() {
                *b = b.wrapping_mul(2);
            }
            let out = Tensor::new_owned(t.data_type(), t.shape().to_vec(), bytes)
                .map_err(|e| StageError::Predict(e.to_string()))?;
            Ok(vec![("y".to_string(), out)])
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl PhaseExecutor for AlwaysFails {
        async fn run(&self, _instance: &Instance) -> std::result::Result<Vec<(String, Tensor)>, StageError> {
            Err(StageError::Predict("boom".into()))
        }
    }

    #[tokio::test]
    async fn runs_predict_phase_and_stores_output() {
        let exec = PipelineExecutor::new(4).with_phase(Phase::Predict, Arc::new(DoubleExecutor), 2);
        let mut inst = Instance::new();
        inst.set(
            Phase::Input,
            "x",
            Tensor::new_owned(DataType::U8, vec![1], vec![3]).unwrap(),
        );
        let ctx = InstanceContext::new(1, 0, "predict");
        let (out, ctx) = exec.run_instance(inst, ctx).await;
        assert!(!ctx.has_failed());
        assert_eq!(out.get(Phase::Predict, "y").unwrap().as_bytes(), &[6]);
    }

    #[tokio::test]
    async fn failure_in_one_instance_does_not_affect_siblings() {
        let exec = PipelineExecutor::new(4).with_phase(Phase::Predict, Arc::new(AlwaysFails), 2);
        let good_exec = PipelineExecutor::new(4).with_phase(Phase::Predict, Arc::new(DoubleExecutor), 2);

        let mut bad = Instance::new();
        bad.set(Phase::Input, "x", Tensor::new_owned(DataType::U8, vec![1], vec![1]).unwrap());
        let mut good = Instance::new();
        good.set(Phase::Input, "x", Tensor::new_owned(DataType::U8, vec![1], vec![2]).unwrap());

        let results = exec
            .run_batch(vec![bad], vec![InstanceContext::new(1, 0, "predict")])
            .await;
        assert!(results[0].1.has_failed());

        let results = good_exec
            .run_batch(vec![good], vec![InstanceContext::new(1, 1, "predict")])
            .await;
        assert!(!results[0].1.has_failed());
    }

    #[tokio::test]
    async fn skips_postprocess_after_predict_failure() {
        let exec = PipelineExecutor::new(4)
            .with_phase(Phase::Predict, Arc::new(AlwaysFails), 1)
            .with_phase(Phase::Postprocess, Arc::new(DoubleExecutor), 1);
        let inst = Instance::new();
        let ctx = InstanceContext::new(1, 0, "predict");
        let (out, ctx) = exec.run_instance(inst, ctx).await;
        assert!(ctx.has_failed());
        assert!(out.get(Phase::Postprocess, "y").is_none());
    }
}
