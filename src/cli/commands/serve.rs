use std::path::Path;

use futures::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::load::load_config;
use crate::context::AppContext;
use crate::error::Result;
use crate::events::EventBus;

/// Runs the daemon until SIGINT or SIGTERM, then stops running backups and
/// waits for them to record `stopped`.
pub async fn run_serve(config_path: &Path) -> Result<()> {
    let config = load_config(config_path.to_string_lossy().as_ref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "cronvault starting"
    );
    let ctx = AppContext::build(&config)?;
    let shutdown = CancellationToken::new();
    let event_log = tokio::spawn(log_events(ctx.events.clone(), shutdown.clone()));

    ctx.startup(&config).await?;
    let scheduler = ctx.scheduler()?;
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    wait_for_shutdown().await?;
    info!("shutting down");
    shutdown.cancel();
    let _ = scheduler_task.await;
    ctx.executor.shutdown().await;
    let _ = event_log.await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn log_events(events: EventBus, shutdown: CancellationToken) {
    let mut stream = events.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    debug!(event = event.name(), %payload, "event");
                }
                None => break,
            },
        }
    }
}
