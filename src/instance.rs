use std::collections::HashMap;

use crate::error::ServingError;
use crate::tensor::Tensor;

/// Which stage of the pipeline produced a set of named tensors (§3, §4.E).
///
/// Source tags `(phase, index)` wire stage inputs to earlier stages'
/// outputs: a preprocess stage may only cite `Input`, predict may cite
/// `Input` or `Preprocess`, and postprocess may cite any of the three
/// preceding phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Input,
    Preprocess,
    Predict,
    Postprocess,
}

impl Phase {
    /// Phases a stage running in `self` is allowed to cite as a source.
    pub fn allowed_sources(self) -> &'static [Phase] {
        match self {
            Phase::Input => &[],
            Phase::Preprocess => &[Phase::Input],
            Phase::Predict => &[Phase::Input, Phase::Preprocess],
            Phase::Postprocess => &[Phase::Input, Phase::Preprocess, Phase::Predict],
        }
    }
}

/// Per-request bookkeeping carried alongside an [`Instance`] as it moves
/// through the pipeline: identifies which caller and which slot in the
/// batch this instance belongs to, and accumulates the first failure.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub user_id: u64,
    pub instance_index: usize,
    pub method_name: String,
    pub error: Option<ErrorSlot>,
}

/// A captured failure: enough to reconstruct a wire `ErrorMsg` without
/// holding on to the full [`ServingError`] (which may not be `Clone`).
#[derive(Debug, Clone)]
pub struct ErrorSlot {
    pub code: crate::error::ErrorCode,
    pub message: String,
}

impl From<&ServingError> for ErrorSlot {
    fn from(e: &ServingError) -> Self {
        ErrorSlot {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl InstanceContext {
    pub fn new(user_id: u64, instance_index: usize, method_name: impl Into<String>) -> Self {
        InstanceContext {
            user_id,
            instance_index,
            method_name: method_name.into(),
            error: None,
        }
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Record a failure, keeping the first one set (later stages should
    /// not overwrite why an instance actually died).
    pub fn fail(&mut self, err: &ServingError) {
        if self.error.is_none() {
            self.error = Some(ErrorSlot::from(err));
        }
    }
}

/// One request/response unit flowing through the pipeline. Each phase's
/// tensors are kept in their own map so later stages can cite earlier
/// ones by `(phase, name)` without clobbering them.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    input: HashMap<String, Tensor>,
    preprocess: HashMap<String, Tensor>,
    predict: HashMap<String, Tensor>,
    postprocess: HashMap<String, Tensor>,
}

impl Instance {
    pub fn new() -> Self {
        Instance::default()
    }

    pub fn phase_map(&self, phase: Phase) -> &HashMap<String, Tensor> {
        match phase {
            Phase::Input => &self.input,
            Phase::Preprocess => &self.preprocess,
            Phase::Predict => &self.predict,
            Phase::Postprocess => &self.postprocess,
        }
    }

    pub fn phase_map_mut(&mut self, phase: Phase) -> &mut HashMap<String, Tensor> {
        match phase {
            Phase::Input => &mut self.input,
            Phase::Preprocess => &mut self.preprocess,
            Phase::Predict => &mut self.predict,
            Phase::Postprocess => &mut self.postprocess,
        }
    }

    pub fn get(&self, phase: Phase, name: &str) -> Option<&Tensor> {
        self.phase_map(phase).get(name)
    }

    pub fn set(&mut self, phase: Phase, name: impl Into<String>, tensor: Tensor) {
        self.phase_map_mut(phase).insert(name.into(), tensor);
    }
}
