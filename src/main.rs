use anyhow::anyhow;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webhook_reliability::{
    config::{get_config, init_config},
    database::pool::{create_pool, run_migrations},
    routes, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    init_config()?;
    let config = get_config();

    let pool = create_pool(config).await?;
    run_migrations(&pool).await?;

    let app_state = AppState::from_config(pool, config);
    if app_state.handlers.is_empty() {
        warn!("No webhook handler routes configured; every due webhook will be dead-lettered");
    } else {
        info!(handlers = ?app_state.handlers.types(), "Webhook handlers registered");
    }

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("Failed to create retry scheduler: {:?}", e))?;
    {
        let state = app_state.clone();
        let job = Job::new_async(config.retry_cron.as_str(), move |_id, _scheduler| {
            let state = state.clone();
            Box::pin(async move {
                state
                    .retry_service
                    .process_pending_webhooks(&state.handlers)
                    .await;
            })
        })
        .map_err(|e| anyhow!("Invalid WEBHOOK_RETRY_CRON '{}': {:?}", config.retry_cron, e))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| anyhow!("Failed to schedule webhook retries: {:?}", e))?;
    }
    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start retry scheduler: {:?}", e))?;
    info!(cron = %config.retry_cron, "Webhook retry scheduler started");

    let app = routes::admin_router(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
