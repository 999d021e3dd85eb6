use std::sync::Arc;

use approval_core::clock::SystemClock;
use approval_engine::gate::PreResolvedExtractor;
use approval_engine::{ApprovalEngineService, ExecutionEngine};
use persistence_pg::PgStore;
use tonic::transport::Server;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_json_logging();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:50061".to_string());

    let store = Arc::new(PgStore::connect(&database_url, 10).await?);

    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        Arc::new(notifier::NullSink),
        Arc::new(SystemClock),
    ));
    let resolver = Arc::new(approval_engine::authority::StaticAuthorityResolver::new());
    let service = ApprovalEngineService::new(store, engine, Arc::new(PreResolvedExtractor), resolver, true);

    let addr = listen_addr.parse()?;
    info!(%addr, "approval-engine listening");
    Server::builder().add_service(service.into_server()).serve(addr).await?;
    Ok(())
}
