use std::collections::HashSet;
use std::sync::Arc;

use tonic::transport::{Endpoint, Server};

use ms_serving_core::batcher::{BatcherPhaseExecutor, Model, PassthroughModel, PredictBatcher};
use ms_serving_core::config::{init_tracing, Config};
use ms_serving_core::grpc::AgentService;
use ms_serving_core::instance::Phase;
use ms_serving_core::pipeline::PipelineExecutor;
use ms_serving_core::proto::ms_agent_server::MsAgentServer;
use ms_serving_core::proto::ms_distributed_worker_client::MsDistributedWorkerClient;
use ms_serving_core::proto::{AgentRegisterRequest, AgentSpec};
use ms_serving_core::registration::{register_with_retry, RetryPolicy};
use ms_serving_core::signal::SignalHandle;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "agent.toml".to_string());
    let config = Config::from_toml_file(&config_path).await?;
    init_tracing(&config);

    let rank_id: u32 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    // Every agent is one rank of a distributed servable and runs its own
    // local predict backend (§4.G): the coordinator only ever talks to
    // agents, never to a model directly.
    let model: Arc<dyn Model> = Arc::new(PassthroughModel);
    let without_batch_dim_inputs: HashSet<String> =
        config.without_batch_dim_inputs.iter().cloned().collect();
    let batcher = PredictBatcher::spawn(
        model,
        config.batch_size,
        config.max_batch_wait(),
        without_batch_dim_inputs,
    );
    let pipeline = Arc::new(PipelineExecutor::new(config.stage_pool_size).with_phase(
        Phase::Predict,
        Arc::new(BatcherPhaseExecutor::new(batcher)),
        config.stage_pool_size,
    ));
    let signal = SignalHandle::new();
    let service = AgentService::new(rank_id, pipeline, signal.clone());

    let addr = config.bind_address.parse()?;
    tracing::info!(%addr, rank_id, "agent listening");

    let max_size = config.max_message_size_bytes;
    let server = tokio::spawn(
        Server::builder()
            .add_service(
                MsAgentServer::new(service)
                    .max_decoding_message_size(max_size)
                    .max_encoding_message_size(max_size),
            )
            .serve_with_shutdown(addr, signal.agent_wait()),
    );

    if let Some(worker_address) = config.upstream_address.clone() {
        let bind_address = config.bind_address.clone();
        let retry = RetryPolicy::default();
        register_with_retry(&retry, || {
            let worker_address = worker_address.clone();
            let bind_address = bind_address.clone();
            async move {
                let endpoint = Endpoint::from_shared(worker_address.clone())
                    .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                let channel = endpoint
                    .connect()
                    .await
                    .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                let mut client = MsDistributedWorkerClient::new(channel)
                    .max_decoding_message_size(max_size)
                    .max_encoding_message_size(max_size);
                client
                    .agent_register(AgentRegisterRequest {
                        agent_specs: vec![AgentSpec {
                            agent_address: bind_address.clone(),
                            rank_id,
                            input_infos: vec![],
                            output_infos: vec![],
                            batch_size: 1,
                        }],
                        address: bind_address,
                    })
                    .await
                    .map_err(|e| ms_serving_core::error::ServingError::System(e.to_string()))?;
                Ok(())
            }
        })
        .await?;
    }

    server.await??;
    Ok(())
}
