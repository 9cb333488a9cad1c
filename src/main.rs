use leaseboard::config::{CoordinatorConfig, env_parse};
use leaseboard::lease::authority::PgLeaseAuthority;
use leaseboard::services::object::PgObjectStore;
use leaseboard::state::AppState;
use leaseboard::{db, routes, services};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoordinatorConfig::from_env();
    let port: u16 = env_parse("PORT", 3000);

    let state = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = db::init_pool(&database_url)
                .await
                .expect("database init failed");
            AppState::new(config, Arc::new(PgLeaseAuthority::new(pool.clone())), Arc::new(PgObjectStore::new(pool)))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; leases and objects live in memory");
            AppState::in_memory(config)
        }
    };

    // Spawn background lease sweeper and presence pruner.
    let _maintenance = services::canvas::spawn_maintenance_task(state.clone());

    let node_id = state.node_id;
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, %node_id, ttl_ms = config.claim_duration_ms, "leaseboard listening");
    axum::serve(listener, app).await.expect("server failed");
}
