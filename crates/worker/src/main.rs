use std::sync::Arc;

use tokio::sync::watch;

use beacon_common::config::AppConfig;
use beacon_common::db;
use beacon_common::redis_pool::create_redis_pool;
use beacon_engine::context::{EngineContext, EngineSettings};
use beacon_engine::dispatcher::Dispatcher;
use beacon_engine::maintenance::Maintenance;
use beacon_engine::pg_store::PgStore;
use beacon_engine::queue::{QueueManager, QueueSettings};
use beacon_engine::redis_broker::RedisBroker;
use beacon_engine::scheduler::Scheduler;
use beacon_notifier::DeliveryGateway;
use beacon_notifier::fcm::FcmClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_worker=info,beacon_engine=info,beacon_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Beacon worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    // Connect to the job broker
    let redis = create_redis_pool(&config.redis_url).await?;
    let broker = Arc::new(RedisBroker::new(redis, config.queue_prefix.clone()));

    // Push provider
    let provider = Arc::new(FcmClient::from_config(&config).await?);

    let ctx = Arc::new(EngineContext::new(
        Arc::new(PgStore::new(pool)),
        QueueManager::new(broker, QueueSettings::from_config(&config)),
        DeliveryGateway::new(provider),
        EngineSettings::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(Dispatcher::new(ctx.clone()));
    let mut tasks = dispatcher.spawn_pools(shutdown_rx.clone());
    tasks.push(tokio::spawn(Scheduler::new(ctx.clone()).run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(Maintenance::new(ctx).run(shutdown_rx)));

    tracing::info!(tasks = tasks.len(), "Beacon worker running");

    // Run until Ctrl+C, then let in-flight jobs finish
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    shutdown_tx.send(true)?;
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Task exited abnormally");
        }
    }

    tracing::info!("Beacon worker stopped.");
    Ok(())
}
