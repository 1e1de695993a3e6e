use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Endpoint, Server};

use ms_serving_core::batcher::{BatcherPhaseExecutor, Model, PassthroughModel, PredictBatcher};
use ms_serving_core::config::{init_tracing, Config};
use ms_serving_core::coordinator::{CoordinatorPhaseExecutor, DistributedCoordinator};
use ms_serving_core::grpc::{DistributedWorkerService, WorkerService};
use ms_serving_core::instance::Phase;
use ms_serving_core::pipeline::PipelineExecutor;
use ms_serving_core::proto::ms_distributed_worker_server::MsDistributedWorkerServer;
use ms_serving_core::proto::ms_master_client::MsMasterClient;
use ms_serving_core::proto::ms_worker_server::MsWorkerServer;
use ms_serving_core::proto::{MethodSignature, PingRequest, RegisterRequest, WorkerSpec};
use ms_serving_core::ranktable::RankTable;
use ms_serving_core::registration::{register_with_retry, run_heartbeat, RetryPolicy};
use ms_serving_core::registry::{MethodDecl, ServableRegistry, StageDecl, StageSource};
use ms_serving_core::signal::SignalHandle;

/// What a declared servable needs wired into the gRPC server: always a
/// predict-phase executor, plus (for a distributed servable) the
/// coordinator agents register against and the rank table content served
/// back to them.
struct ServableSetup {
    predict_executor: Arc<dyn ms_serving_core::pipeline::PhaseExecutor>,
    distributed: Option<(Arc<DistributedCoordinator>, String)>,
}

/// Build this worker's one declared servable and the predict-phase
/// executor it runs: a local model's batcher, or a distributed servable's
/// coordinator fan-out, chosen by whether `rank_table_path` is set (§3).
async fn declare_servable(
    config: &Config,
    registry: &ServableRegistry,
) -> Result<ServableSetup, Box<dyn std::error::Error>> {
    let without_batch_dim_inputs: HashSet<String> =
        config.without_batch_dim_inputs.iter().cloned().collect();
    let input_count = config.input_names.len().max(1);
    let output_count = config.output_names.len().max(1);
    let stages = vec![
        StageDecl {
            phase: Phase::Input,
            output_count: input_count,
            sources: vec![],
        },
        StageDecl {
            phase: Phase::Predict,
            output_count,
            sources: vec![StageSource {
                phase: Phase::Input,
                index: 0,
            }],
        },
    ];
    let methods = vec![MethodDecl {
        method_name: config.method_name.clone(),
        input_sources: (0..input_count)
            .map(|index| StageSource {
                phase: Phase::Input,
                index,
            })
            .collect(),
        output_sources: (0..output_count)
            .map(|index| StageSource {
                phase: Phase::Predict,
                index,
            })
            .collect(),
    }];

    match &config.rank_table_path {
        Some(path) => {
            let content = tokio::fs::read_to_string(path).await?;
            let rank_table = RankTable::parse(&content)?;
            registry.declare_distributed(
                config.servable_name.clone(),
                config.version_number,
                rank_table.rank_size,
                rank_table.stage_size,
                stages,
                methods,
                without_batch_dim_inputs,
            )?;
            let coordinator = Arc::new(DistributedCoordinator::new(
                rank_table,
                config.registration_timeout(),
            ));

            let waiter = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = waiter.wait_for_all_agents().await {
                    tracing::warn!(error = %e, "not every agent registered in time");
                }
            });

            Ok(ServableSetup {
                predict_executor: Arc::new(CoordinatorPhaseExecutor::new(
                    coordinator.clone(),
                    config.rank_poll_timeout(),
                )),
                distributed: Some((coordinator, content)),
            })
        }
        None => {
            registry.declare_local(
                config.servable_name.clone(),
                config.version_number,
                config.model_path.clone().unwrap_or_default(),
                config.parsed_model_format(),
                stages,
                methods,
                without_batch_dim_inputs,
            )?;
            let model: Arc<dyn Model> = Arc::new(PassthroughModel);
            let batcher = PredictBatcher::spawn(
                model,
                config.batch_size,
                config.max_batch_wait(),
                HashSet::new(),
            );
            Ok(ServableSetup {
                predict_executor: Arc::new(BatcherPhaseExecutor::new(batcher)),
                distributed: None,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "worker.toml".to_string());
    let config = Config::from_toml_file(&config_path).await?;
    init_tracing(&config);

    let registry = Arc::new(ServableRegistry::new());
    let setup = declare_servable(&config, &registry).await?;

    let pipeline = Arc::new(PipelineExecutor::new(config.stage_pool_size).with_phase(
        Phase::Predict,
        setup.predict_executor,
        config.stage_pool_size,
    ));
    let signal = SignalHandle::new();
    let service = WorkerService::new(pipeline, registry.clone(), signal.clone());

    let addr = config.bind_address.parse()?;
    tracing::info!(%addr, "worker listening");

    let max_size = config.max_message_size_bytes;
    let mut builder = Server::builder().add_service(
        MsWorkerServer::new(service)
            .max_decoding_message_size(max_size)
            .max_encoding_message_size(max_size),
    );

    // A distributed servable's worker also hosts the coordinator agents
    // register against over `MSDistributedWorker` (§4.G) — the same
    // coordinator instance the predict phase fans out through.
    if let Some((coordinator, rank_table_content)) = setup.distributed {
        builder = builder.add_service(
            MsDistributedWorkerServer::new(DistributedWorkerService::new(
                coordinator,
                rank_table_content,
            ))
            .max_decoding_message_size(max_size)
            .max_encoding_message_size(max_size),
        );
    }

    let server = tokio::spawn(builder.serve_with_shutdown(addr, signal.worker_wait()));

    if let Some(master_address) = config.upstream_address.clone() {
        let bind_address = config.bind_address.clone();
        let servable_name = config.servable_name.clone();
        let version_number = config.version_number;
        let method_name = config.method_name.clone();
        let retry = RetryPolicy::default();
        register_with_retry(&retry, || {
            let master_address = master_address.clone();
            let bind_address = bind_address.clone();
            let servable_name = servable_name.clone();
            let method_name = method_name.clone();
            async move {
                let endpoint = Endpoint::from_shared(master_address.clone())
                    .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                let channel = endpoint
                    .connect()
                    .await
                    .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                let mut client = MsMasterClient::new(channel)
                    .max_decoding_message_size(max_size)
                    .max_encoding_message_size(max_size);
                client
                    .register(RegisterRequest {
                        worker_specs: vec![WorkerSpec {
                            servable_name,
                            version_number,
                            worker_address: bind_address.clone(),
                            methods: vec![MethodSignature {
                                method_name,
                                inputs: vec![],
                                outputs: vec![],
                            }],
                        }],
                        address: bind_address,
                    })
                    .await
                    .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                Ok(())
            }
        })
        .await?;

        let heartbeat_signal = signal.clone();
        let master_address_for_hb = master_address.clone();
        let heartbeat_interval = config.heartbeat.interval();
        let heartbeat_missed_limit = config.heartbeat.missed_limit;
        tokio::spawn(async move {
            let endpoint = match Endpoint::from_shared(master_address_for_hb) {
                Ok(e) => e,
                Err(_) => return,
            };
            let mut seq = 0u64;
            run_heartbeat(heartbeat_interval, heartbeat_missed_limit, heartbeat_signal, move || {
                seq += 1;
                let endpoint = endpoint.clone();
                let seq = seq;
                async move {
                    let channel = endpoint
                        .connect_timeout(Duration::from_secs(2))
                        .connect()
                        .await
                        .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                    let mut client = MsMasterClient::new(channel)
                        .max_decoding_message_size(max_size)
                        .max_encoding_message_size(max_size);
                    client
                        .ping(PingRequest { seq })
                        .await
                        .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                    Ok(())
                }
            })
            .await;
        });
    }

    server.await??;
    Ok(())
}
