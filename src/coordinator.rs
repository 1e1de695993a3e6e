//! Distributed servable coordinator (§4.G), grounded on the source's
//! `DistributedServable`: once a rank table validates, the coordinator
//! waits for every rank's agent to register, then fans predict calls out
//! to all of them and aggregates the leader rank's reply.
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{CoordinatorError, ErrorCode, StageError};
use crate::instance::{Instance, Phase};
use crate::pipeline::PhaseExecutor;
use crate::ranktable::RankTable;
use crate::rpc::AsyncClient;

const REGISTRATION_POLL: Duration = Duration::from_millis(100);

/// Per-rank tensor shape/dtype declaration, used to cross-check that
/// every agent in a servable agrees on its input/output contract.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub dtype: String,
    pub dims: Vec<i64>,
}

/// One rank's registered agent.
#[derive(Clone)]
pub struct AgentContext {
    pub rank_id: u32,
    pub client: AsyncClient,
    pub input_infos: Vec<TensorInfo>,
    pub output_infos: Vec<TensorInfo>,
    pub batch_size: u32,
}

/// Coordinates a rank_size-wide distributed servable. Agents register
/// into a dense, pre-sized slot table; index 0 (rank 0) is the leader
/// whose reply becomes the aggregated result.
pub struct DistributedCoordinator {
    rank_table: RankTable,
    agents: RwLock<Vec<Option<AgentContext>>>,
    registration_timeout: Duration,
}

impl DistributedCoordinator {
    pub fn new(rank_table: RankTable, registration_timeout: Duration) -> Self {
        let rank_size = rank_table.rank_size as usize;
        DistributedCoordinator {
            rank_table,
            agents: RwLock::new(vec![None; rank_size]),
            registration_timeout,
        }
    }

    pub fn rank_size(&self) -> u32 {
        self.rank_table.rank_size
    }

    /// The last-stage leader rank whose reply is authoritative (§4.G step 5).
    pub fn leader_rank(&self) -> u32 {
        self.rank_table.parallel_count() * (self.rank_table.stage_size - 1)
    }

    /// Register one rank's agent, validating it against rank 0's already
    /// registered contract (once rank 0 itself is registered).
    pub fn register_agent(&self, agent: AgentContext) -> Result<(), CoordinatorError> {
        let rank_size = self.rank_size();
        if agent.rank_id >= rank_size {
            return Err(CoordinatorError::RankOutOfRange {
                rank_id: agent.rank_id,
                rank_size,
            });
        }

        let mut agents = self.agents.write().unwrap();
        if agents[agent.rank_id as usize].is_some() {
            return Err(CoordinatorError::DuplicateRank {
                rank_id: agent.rank_id,
            });
        }

        if let Some(leader) = &agents[0] {
            if agent.input_infos != leader.input_infos {
                return Err(CoordinatorError::InputInfosMismatch {
                    rank_id: agent.rank_id,
                });
            }
            if agent.output_infos != leader.output_infos {
                return Err(CoordinatorError::OutputInfosMismatch {
                    rank_id: agent.rank_id,
                });
            }
            if agent.batch_size != leader.batch_size {
                return Err(CoordinatorError::BatchSizeMismatch {
                    rank_id: agent.rank_id,
                    expected: leader.batch_size,
                    actual: agent.batch_size,
                });
            }
        }

        info!(rank_id = agent.rank_id, "agent registered");
        agents[agent.rank_id as usize] = Some(agent);
        Ok(())
    }

    pub fn remove_agent(&self, rank_id: u32) {
        let mut agents = self.agents.write().unwrap();
        if let Some(slot) = agents.get_mut(rank_id as usize) {
            *slot = None;
        }
    }

    fn registered_count(&self) -> usize {
        self.agents.read().unwrap().iter().filter(|a| a.is_some()).count()
    }

    /// Block (polling every [`REGISTRATION_POLL`]) until every rank has
    /// registered, or [`CoordinatorError::RegistrationTimedOut`] once
    /// `registration_timeout` elapses.
    pub async fn wait_for_all_agents(&self) -> Result<(), CoordinatorError> {
        let rank_size = self.rank_size() as usize;
        let start = Instant::now();
        loop {
            if self.registered_count() == rank_size {
                return Ok(());
            }
            if start.elapsed() >= self.registration_timeout {
                return Err(CoordinatorError::RegistrationTimedOut {
                    got: self.registered_count(),
                    rank_size: self.rank_size(),
                    waited_secs: self.registration_timeout.as_secs(),
                });
            }
            tokio::time::sleep(REGISTRATION_POLL).await;
        }
    }

    /// Fan a predict call out to every registered agent and return rank
    /// 0's (the leader's) reply as the aggregated result. Every rank must
    /// reply within `per_rank_timeout`; a missing agent, a timeout, or any
    /// rank returning failure aborts the whole fan-out (§9: RPC failure is
    /// fatal to the whole fan-out, not just that rank).
    pub async fn predict(
        &self,
        instances: Vec<Instance>,
        per_rank_timeout: Duration,
    ) -> Result<Vec<Instance>, CoordinatorError> {
        let agents: Vec<AgentContext> = {
            let guard = self.agents.read().unwrap();
            guard
                .iter()
                .enumerate()
                .map(|(rank_id, slot)| {
                    slot.clone().ok_or(CoordinatorError::RegistrationTimedOut {
                        got: guard.iter().filter(|a| a.is_some()).count(),
                        rank_size: rank_id as u32 + 1,
                        waited_secs: 0,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let leader_rank = self.leader_rank();
        let parallel_count = self.rank_table.parallel_count();
        let calls = agents.into_iter().map(|agent| {
            // Only first-stage agents consume the client's instances (§4.G
            // point 2); later stages receive them via the pipeline between
            // agents, not from the coordinator.
            let payload = if agent.rank_id < parallel_count {
                instances.clone()
            } else {
                instances.iter().map(|_| Instance::new()).collect()
            };
            async move {
                match tokio::time::timeout(per_rank_timeout, call_agent(&agent, payload)).await {
                    Ok(Ok(result)) => Ok((agent.rank_id, result)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(CoordinatorError::RankTimeout { rank_id: agent.rank_id }),
                }
            }
        });

        let results = futures::future::join_all(calls).await;
        let mut leader_reply = None;
        for result in results {
            match result {
                Ok((rank_id, reply)) if rank_id == leader_rank => leader_reply = Some(reply),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "agent fan-out failed, aborting whole call");
                    return Err(e);
                }
            }
        }

        leader_reply.ok_or(CoordinatorError::RankTimeout { rank_id: leader_rank })
    }
}

/// Dispatch one rank's share of a predict call over `MSAgent::Predict`
/// (§6), wrapping each instance's `Phase::Input` tensors as the request
/// and reading the reply back in as `Phase::Predict` (the agent's own
/// local pipeline has already run preprocess/predict/postprocess for us).
async fn call_agent(
    agent: &AgentContext,
    instances: Vec<Instance>,
) -> Result<Vec<Instance>, CoordinatorError> {
    let wire_instances = instances
        .iter()
        .map(|inst| crate::wire::instance_to_wire(inst, Phase::Input))
        .collect();

    let mut client = crate::proto::ms_agent_client::MsAgentClient::new(agent.client.channel());
    let reply = client
        .predict(crate::proto::DistributedPredictRequest {
            rank_id: agent.rank_id,
            instances: wire_instances,
        })
        .await
        .map_err(|status| CoordinatorError::Rpc {
            rank_id: agent.rank_id,
            source: status.message().to_string(),
        })?
        .into_inner();

    let code = ErrorCode::from_i32(reply.error_code);
    if !matches!(code, ErrorCode::Success) {
        return Err(CoordinatorError::RankFailed {
            rank_id: agent.rank_id,
            code,
            message: reply.error_msg,
        });
    }

    reply
        .instances
        .iter()
        .map(|wire_inst| {
            crate::wire::instance_from_wire_as(wire_inst, Phase::Predict).map_err(|e| {
                CoordinatorError::RankFailed {
                    rank_id: agent.rank_id,
                    code: ErrorCode::InvalidInputs,
                    message: e.to_string(),
                }
            })
        })
        .collect()
}

/// Plugs a [`DistributedCoordinator`] into [`PipelineExecutor`](crate::pipeline::PipelineExecutor)'s
/// predict phase: the pipeline sees one instance at a time, so this wraps
/// it in a single-instance fan-out call.
pub struct CoordinatorPhaseExecutor {
    coordinator: Arc<DistributedCoordinator>,
    per_rank_timeout: Duration,
}

impl CoordinatorPhaseExecutor {
    pub fn new(coordinator: Arc<DistributedCoordinator>, per_rank_timeout: Duration) -> Self {
        CoordinatorPhaseExecutor {
            coordinator,
            per_rank_timeout,
        }
    }
}

#[async_trait]
impl PhaseExecutor for CoordinatorPhaseExecutor {
    async fn run(&self, instance: &Instance) -> std::result::Result<Vec<(String, crate::tensor::Tensor)>, StageError> {
        let mut results = self
            .coordinator
            .predict(vec![instance.clone()], self.per_rank_timeout)
            .await
            .map_err(|e| StageError::Predict(e.to_string()))?;
        let leader = results.pop().ok_or_else(|| StageError::Predict("coordinator returned no instance".into()))?;
        Ok(leader
            .phase_map(Phase::Predict)
            .iter()
            .map(|(name, t)| (name.clone(), t.clone()))
            .collect())
    }
}
