use std::sync::Arc;

use anyhow::Result;
use rmcp::ServiceExt;
use tracing_subscriber::{self, EnvFilter};

use strategy_worker::config::WorkerConfig;
use strategy_worker::data::pool;
use strategy_worker::server::StrategyWorkerServer;
use strategy_worker::task::bus::{MessageBus, RedisBus};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(worker_id = %config.worker_id, environment = ?config.environment, "loaded configuration");

    let db_pool = pool::connect(&config).await?;
    let bus: Arc<dyn MessageBus> = Arc::new(RedisBus::connect(&config.redis_url).await?);

    if let Ok(port) = std::env::var("PORT") {
        // HTTP mode — used by cloud platforms.
        use rmcp::transport::streamable_http_server::{
            session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
        };

        let service = StreamableHttpService::new(
            move || {
                Ok(StrategyWorkerServer::new(
                    db_pool.clone(),
                    bus.clone(),
                    config.clone(),
                ))
            },
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        );

        let app = axum::Router::new()
            .nest_service("/mcp", service)
            .route("/health", axum::routing::get(|| async { "ok" }));

        let addr = format!("0.0.0.0:{port}");
        tracing::info!("Starting strategy-worker HTTP server on {addr}");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        // stdio mode — used for local development.
        tracing::info!("Starting strategy-worker MCP server (stdio)");

        let server = StrategyWorkerServer::new(db_pool, bus, config);
        let service = server.serve(rmcp::transport::stdio()).await?;
        service.waiting().await?;
    }

    Ok(())
}
