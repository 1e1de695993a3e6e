//! Servable registry (§3, §4.B).
//!
//! A servable declares, per pipeline phase, how many named outputs that
//! phase produces, plus the wiring of where each phase's outputs are
//! computed from (a list of `(Phase, index)` source tags into earlier
//! phases) and which named tensors each callable method takes as input and
//! returns as output. [`ServableRegistry::declare`] runs the same shape of
//! validation the source's `Check()` does before a servable is allowed to
//! start serving traffic.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::error::RegistryError;
use crate::instance::Phase;

/// The model file format a locally-served servable's backend loads (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Om,
    MindIr,
}

/// §3's servable-level type distinction: a servable either runs its
/// predict phase against a locally loaded model, or fans it out to a
/// `rank_size`-wide distributed coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServableKind {
    Local {
        model_file: String,
        model_format: ModelFormat,
    },
    Distributed {
        rank_size: u32,
        stage_size: u32,
    },
}

/// A reference to one of an earlier phase's named outputs by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSource {
    pub phase: Phase,
    pub index: usize,
}

/// How one pipeline phase computes its outputs: how many it produces, and
/// which earlier phases' outputs feed it.
#[derive(Debug, Clone)]
pub struct StageDecl {
    pub phase: Phase,
    pub output_count: usize,
    pub sources: Vec<StageSource>,
}

/// A callable method's input/output wiring, naming which stage outputs
/// form each input and output tensor.
#[derive(Debug, Clone)]
pub struct MethodDecl {
    pub method_name: String,
    pub input_sources: Vec<StageSource>,
    pub output_sources: Vec<StageSource>,
}

/// A fully declared, validated servable.
#[derive(Debug, Clone)]
pub struct ServableSignature {
    pub name: String,
    pub version_number: u64,
    pub kind: ServableKind,
    pub stages: Vec<StageDecl>,
    pub methods: HashMap<String, MethodDecl>,
    /// Input names that carry no batch dimension (§4.E): broadcast from
    /// instance 0 rather than packed one value per instance.
    pub without_batch_dim_inputs: HashSet<String>,
}

impl ServableSignature {
    fn output_count(&self, phase: Phase) -> Option<usize> {
        self.stages
            .iter()
            .find(|s| s.phase == phase)
            .map(|s| s.output_count)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDecl> {
        self.methods.get(name)
    }

    pub fn input_arity(&self, method: &str) -> Option<usize> {
        self.methods.get(method).map(|m| m.input_sources.len())
    }

    pub fn output_arity(&self, method: &str) -> Option<usize> {
        self.methods.get(method).map(|m| m.output_sources.len())
    }
}

fn validate_source(
    servable: &str,
    method: &str,
    src: StageSource,
    counts: &HashMap<Phase, usize>,
) -> Result<(), RegistryError> {
    let phase_size = *counts.get(&src.phase).unwrap_or(&0);
    if src.index >= phase_size {
        return Err(RegistryError::DanglingSourceTag {
            servable: servable.to_string(),
            method: method.to_string(),
            phase: src.phase,
            index: src.index,
            phase_size,
        });
    }
    Ok(())
}

/// Process-wide table of declared servables, keyed by name. Concurrent
/// lookups (one per incoming predict call) take a read lock; declaration
/// and teardown take a write lock, mirroring how rarely servables are
/// (un)registered relative to how often they're dispatched to.
#[derive(Default)]
pub struct ServableRegistry {
    servables: RwLock<HashMap<String, Arc<ServableSignature>>>,
}

impl ServableRegistry {
    pub fn new() -> Self {
        ServableRegistry::default()
    }

    /// Declare a locally served servable: predict runs against a model
    /// file loaded by the worker's own backend.
    #[allow(clippy::too_many_arguments)]
    pub fn declare_local(
        &self,
        name: impl Into<String>,
        version_number: u64,
        model_file: impl Into<String>,
        model_format: ModelFormat,
        stages: Vec<StageDecl>,
        methods: Vec<MethodDecl>,
        without_batch_dim_inputs: HashSet<String>,
    ) -> Result<Arc<ServableSignature>, RegistryError> {
        self.declare(
            name,
            version_number,
            ServableKind::Local {
                model_file: model_file.into(),
                model_format,
            },
            stages,
            methods,
            without_batch_dim_inputs,
        )
    }

    /// Declare a distributed servable: predict fans out to `rank_size`
    /// agents over `stage_size` pipeline stages (§4.G).
    #[allow(clippy::too_many_arguments)]
    pub fn declare_distributed(
        &self,
        name: impl Into<String>,
        version_number: u64,
        rank_size: u32,
        stage_size: u32,
        stages: Vec<StageDecl>,
        methods: Vec<MethodDecl>,
        without_batch_dim_inputs: HashSet<String>,
    ) -> Result<Arc<ServableSignature>, RegistryError> {
        self.declare(
            name,
            version_number,
            ServableKind::Distributed {
                rank_size,
                stage_size,
            },
            stages,
            methods,
            without_batch_dim_inputs,
        )
    }

    /// Validate and install a servable declaration. A servable already
    /// declared with a different version/arity/kind is a
    /// [`RegistryError::TypeConflict`]; declaring the exact same servable
    /// twice is idempotent.
    #[allow(clippy::too_many_arguments)]
    pub fn declare(
        &self,
        name: impl Into<String>,
        version_number: u64,
        kind: ServableKind,
        stages: Vec<StageDecl>,
        methods: Vec<MethodDecl>,
        without_batch_dim_inputs: HashSet<String>,
    ) -> Result<Arc<ServableSignature>, RegistryError> {
        let name = name.into();
        let counts: HashMap<Phase, usize> =
            stages.iter().map(|s| (s.phase, s.output_count)).collect();

        for stage in &stages {
            for src in &stage.sources {
                if src.phase == stage.phase {
                    return Err(RegistryError::SelfCitingPhase {
                        servable: name.clone(),
                        method: String::new(),
                        phase: stage.phase,
                    });
                }
                if !stage.phase.allowed_sources().contains(&src.phase) {
                    return Err(RegistryError::DanglingSourceTag {
                        servable: name.clone(),
                        method: String::new(),
                        phase: src.phase,
                        index: src.index,
                        phase_size: 0,
                    });
                }
                validate_source(&name, "<stage-wiring>", *src, &counts)?;
            }
        }

        let mut method_map = HashMap::with_capacity(methods.len());
        for m in methods {
            if method_map.contains_key(&m.method_name) {
                return Err(RegistryError::DuplicateMethod {
                    servable: name.clone(),
                    method: m.method_name.clone(),
                });
            }
            for src in m.input_sources.iter().chain(m.output_sources.iter()) {
                validate_source(&name, &m.method_name, *src, &counts)?;
            }
            method_map.insert(m.method_name.clone(), m);
        }

        let signature = Arc::new(ServableSignature {
            name: name.clone(),
            version_number,
            kind,
            stages,
            methods: method_map,
            without_batch_dim_inputs,
        });

        let mut servables = self.servables.write().unwrap();
        if let Some(existing) = servables.get(&name) {
            if existing.version_number != version_number
                || existing.methods.len() != signature.methods.len()
                || existing.kind != signature.kind
            {
                return Err(RegistryError::TypeConflict(name));
            }
            return Ok(existing.clone());
        }
        servables.insert(name, signature.clone());
        Ok(signature)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ServableSignature>, RegistryError> {
        self.servables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownServable(name.to_string()))
    }

    pub fn remove(&self, name: &str) {
        self.servables.write().unwrap().remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.servables.read().unwrap().keys().cloned().collect()
    }

    /// Drop every declared servable (§4.B's `Clear()`), used when a
    /// process is tearing down or reloading its whole serving config.
    pub fn clear(&self) {
        self.servables.write().unwrap().clear();
    }
}
