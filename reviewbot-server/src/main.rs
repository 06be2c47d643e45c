use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reviewbot_core::CompletionClient;
use reviewbot_server::config::Config;
use reviewbot_server::{
    build_router, AppState, Dispatcher, GitHubClient, LockRegistry, PrProcessor,
    SqliteRecordStore,
};

/// Periodically drop lock entries no task is using.
async fn lock_pruning_loop(locks: Arc<LockRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let pruned = locks.prune_idle().await;
        if pruned > 0 {
            info!("Pruned {} idle PR locks", pruned);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "Starting PR review bot v{}",
        reviewbot_server::get_bot_version()
    );

    let config = Config::from_env().context("Failed to load configuration")?;

    if config.github_webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET is not set; webhook signatures will not be verified");
    }
    if config.status_auth_token.is_none() {
        warn!("STATUS_AUTH_TOKEN is not set; /status is readable without authentication");
    }

    let github_client = GitHubClient::new(
        config.github_app_id,
        &config.github_private_key,
        &config.github_api_url,
    )?;

    let completion_client = CompletionClient::new(
        config.completion_api_key.clone(),
        config.completion_base_url.clone(),
        config.completion_model.clone(),
    )?;
    info!("Using completion model {}", completion_client.model());

    let db_path = config.database_path();
    info!("Using record database: {}", db_path.display());
    let record_store = Arc::new(
        SqliteRecordStore::open(&db_path).context("Failed to initialize SQLite database")?,
    );

    let processor = Arc::new(PrProcessor::new(
        Arc::new(github_client),
        Arc::new(completion_client),
        record_store.clone(),
    ));
    let locks = Arc::new(LockRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        locks.clone(),
        record_store.clone(),
        processor,
        config.dispatcher_config(),
    ));

    if let Some(interval) = config.lock_prune_interval {
        tokio::spawn(lock_pruning_loop(locks, interval));
    }

    let app_state = Arc::new(AppState {
        dispatcher: dispatcher.clone(),
        record_store,
        webhook_secret: config.github_webhook_secret.clone(),
        status_auth_token: config.status_auth_token.clone(),
    });
    let app = build_router(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight reviews finish, then cancel whatever is left.
    info!(
        "Waiting up to {:?} for {} in-flight reviews",
        config.review_timeout,
        dispatcher.in_flight()
    );
    if tokio::time::timeout(config.review_timeout, dispatcher.wait_idle())
        .await
        .is_err()
    {
        warn!("Reviews still running at shutdown deadline, cancelling");
        dispatcher.shutdown();
        dispatcher.wait_idle().await;
    }

    info!("Shutdown complete");
    Ok(())
}
