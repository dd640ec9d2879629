use common::config;
use master::failover;
use master::{build_router, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("master=debug,axum=info,common=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = AppState::new();

    // router HTTP
    let app = build_router(state.clone());

    // leases vencidos en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let addr = config::master_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "master escuchando en {} (lease de {:?})",
        listener.local_addr()?,
        state.broker.lease_timeout()
    );

    axum::serve(listener, app).await?;
    Ok(())
}
