#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, get, listener::TcpListener, middleware::Tracing};
use tracing::{debug, info};

mod gateway;

use gateway::Gateway;
use gateway::config::GatewayConfig;
use gateway::connections::ConnectionMap;
use gateway::health::HealthMonitor;
use gateway::registry::HostRegistry;
use gateway::types::OutboundFrame;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = GatewayConfig::from_env();

    // Invalid host or transfer configuration aborts startup.
    let registry = Arc::new(HostRegistry::from_env()?);
    info!("Host registry loaded: {} hosts", registry.all_hosts().len());

    let connections = Arc::new(ConnectionMap::new());
    let health = Arc::new(HealthMonitor::new(&config, registry.all_hosts()));

    // Every health transition fans out to all connected clients.
    let broadcast_targets = connections.clone();
    health.register_listener(Arc::new(move |server_name, status| {
        let connections = broadcast_targets.clone();
        Box::pin(async move {
            let delivered = connections.broadcast_json(&OutboundFrame::ServerHealth {
                server_name,
                is_healthy: status.is_healthy,
                status,
            });
            debug!("Health transition broadcast to {} clients", delivered);
        })
    }));
    health.start();

    let gateway = Arc::new(Gateway::new(config, registry, health.clone(), connections));

    let port: u16 = std::env::var("GATEWAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting stub gateway on {}", addr);

    let app = Route::new()
        .at("/ws/v1/stub", get(gateway::ws::stub_websocket))
        .data(gateway)
        .with(Tracing);

    info!("WebSocket endpoint ready at /ws/v1/stub");

    Server::new(TcpListener::bind(addr))
        .name("Stub SSH Gateway")
        .run(app)
        .await?;

    health.stop().await;

    Ok(())
}
