use std::sync::Arc;

use tonic::transport::Server;

use ms_serving_core::config::{init_tracing, Config};
use ms_serving_core::dispatcher::Dispatcher;
use ms_serving_core::grpc::MasterService;
use ms_serving_core::proto::ms_master_server::MsMasterServer;
use ms_serving_core::proto::ms_service_server::MsServiceServer;
use ms_serving_core::signal::SignalHandle;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "master.toml".to_string());
    let config = Config::from_toml_file(&config_path).await?;
    init_tracing(&config);

    let dispatcher = Arc::new(Dispatcher::new());
    let signal = SignalHandle::new();
    let max_size = config.max_message_size_bytes;
    let service = MasterService::with_max_message_size(dispatcher, signal.clone(), max_size);

    let addr = config.bind_address.parse()?;
    tracing::info!(%addr, "master listening");
    Server::builder()
        .add_service(
            MsServiceServer::new(service.clone())
                .max_decoding_message_size(max_size)
                .max_encoding_message_size(max_size),
        )
        .add_service(
            MsMasterServer::new(service)
                .max_decoding_message_size(max_size)
                .max_encoding_message_size(max_size),
        )
        .serve_with_shutdown(addr, signal.master_wait())
        .await?;

    Ok(())
}
