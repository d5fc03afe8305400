use anyhow::Result;
use std::sync::Arc;

use pyroscope_daemon::api::{self, AppState};
use pyroscope_daemon::broadcaster::Broadcaster;
use pyroscope_daemon::buffer::WriteBackBuffer;
use pyroscope_daemon::config::Config;
use pyroscope_daemon::db::Db;
use pyroscope_daemon::logging;
use pyroscope_daemon::logging::LogBuffer;
use pyroscope_daemon::parameters::ParameterService;
use pyroscope_daemon::registry::DeviceRegistry;
use pyroscope_daemon::scheduler::Scheduler;
use pyroscope_daemon::store::ReadingStore;

const LOG_BUFFER_CAPACITY: usize = 500;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = Config::from_env()?;
    log::info!("starting on {}", config.bind_addr);

    let log_buffer = Arc::new(LogBuffer::new(LOG_BUFFER_CAPACITY));

    let db = Db::open(&config.database_url)?;
    let registry = DeviceRegistry::new(db.clone());
    let store = ReadingStore::new(db);

    let buffer = WriteBackBuffer::new(
        store.clone(),
        config.buffer_threshold,
        config.buffer_max_hold,
        log_buffer.clone(),
    );
    let broadcaster = Broadcaster::new(config.subscriber_queue_capacity, config.subscriber_evict_after_drops);

    let scheduler = Scheduler::new(
        config.clone(),
        registry.clone(),
        buffer.clone(),
        broadcaster.clone(),
        log_buffer.clone(),
    );
    scheduler.start().await?;

    let params = Arc::new(ParameterService::new(scheduler.clone(), registry.clone()));

    let state = Arc::new(AppState {
        registry,
        store,
        buffer: buffer.clone(),
        scheduler: scheduler.clone(),
        broadcaster,
        params,
        config: config.clone(),
        log_buffer,
    });

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    log::info!("listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler, buffer))
        .await?;

    Ok(())
}

/// Stop taking new poll ticks, let transactions already in flight finish,
/// then force a final buffer swap-and-flush before the process exits —
/// otherwise whatever's sitting in the active slot is lost on restart.
async fn shutdown_signal(scheduler: Arc<Scheduler>, buffer: Arc<WriteBackBuffer>) {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown signal received");
    scheduler.shutdown().await;
    buffer.flush_now().await;
}
