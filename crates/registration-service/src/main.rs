//! Registration host - entry point.

use anyhow::Context;
use registration_service::{
    api::{create_router_with_rate_limit, AppState, RateLimitState},
    config::Config,
    open_store, HttpAccountClientFactory, Service,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting registration service");

    let store = open_store(
        config.store.path.clone(),
        config.store.persist,
        config.store.secret.as_ref(),
    )
    .await
    .context("Failed to open local store")?;

    let accounts = HttpAccountClientFactory::new(
        config.account.service_url.clone(),
        config.account.timeout,
        &config.account.user_agent,
    )
    .context("Failed to create account client")?;

    let service = Service::build(&config, store, Arc::new(accounts));
    if let Err(e) = service.resume_jobs().await {
        warn!(error = %e, "Failed to resume periodic jobs");
    }

    let rate_limit = RateLimitState::new(config.rate_limit.global_per_minute);
    let app = create_router_with_rate_limit(AppState::new(&service), rate_limit);

    let addr = SocketAddr::new(
        config
            .server
            .listen_addr
            .parse()
            .unwrap_or([127, 0, 0, 1].into()),
        config.server.port,
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    info!("Shutting down");
    service.machine.shutdown().await?;
    Ok(())
}
