use anyhow::Result;
use dotenvy::dotenv;
use shared::config::GmailConnectorConfig;
use shared::storage::StorageFactory;
use shared::telemetry::{self, TelemetryConfig};
use shared::DatabasePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crm_gmail_connector::api::{create_router, ApiState};
use crm_gmail_connector::sync::IngestionPipeline;
use crm_gmail_connector::watch::WatchRegistrar;
use crm_gmail_connector::{MailSyncEngine, Stores};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let telemetry_config = TelemetryConfig::from_env("crm-gmail-connector");
    telemetry::init_telemetry(telemetry_config)?;

    info!("Starting Gmail connector");

    let config = GmailConnectorConfig::from_env();

    let db = DatabasePool::from_config(&config.database).await?;
    db.run_migrations().await?;

    let storage = StorageFactory::create(&config.storage, db.pool().clone()).await?;
    info!("Object storage backend: {}", storage.backend_name());

    let engine = MailSyncEngine::new(&config, Stores::postgres(&db, storage))?;

    if let Some(interval_seconds) = config.sync.poll_interval_seconds {
        let pipeline = Arc::clone(&engine.pipeline);
        tokio::spawn(async move {
            poll_loop(pipeline, interval_seconds).await;
        });
        info!("Scheduled poll started (interval: {}s)", interval_seconds);
    } else {
        info!("Scheduled poll disabled; syncing on push notifications only");
    }

    if engine.watch.is_enabled() {
        let watch = engine.watch.clone();
        let renewal_interval = config.sync.watch_renewal_interval_seconds;
        tokio::spawn(async move {
            watch_renewal_loop(watch, renewal_interval).await;
        });
        info!(
            "Watch renewal loop started (interval: {}s)",
            renewal_interval
        );
    } else {
        info!("No push topic configured, watch renewal disabled");
    }

    let app = create_router(ApiState { engine });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("HTTP server listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("HTTP server stopped: {:?}", e);
    }

    db.close().await;
    telemetry::shutdown_telemetry().await;
    Ok(())
}

async fn poll_loop(pipeline: Arc<IngestionPipeline>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match pipeline.run_all_linked().await {
            Ok(completed) => info!("Scheduled poll finished: {} mailbox(es) synced", completed),
            Err(e) => error!("Scheduled poll failed: {}", e),
        }
    }
}

async fn watch_renewal_loop(watch: WatchRegistrar, interval_seconds: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        info!("Running watch renewal check");

        match watch.renew_expiring().await {
            Ok(renewed) => info!("Watch renewal check done: {} renewed", renewed),
            Err(e) => error!("Watch renewal check failed: {}", e),
        }
    }
}
